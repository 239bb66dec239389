use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum StoreError {
    #[error("exclusive schema lock unavailable: {0}")]
    LockUnavailable(String),
    #[error("note not found: {0}")]
    NotFound(NoteId),
    #[error("note id already taken: {0}")]
    IdTaken(NoteId),
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Unique note primary key: milliseconds since the Unix epoch at creation
/// time, so larger ids were created later and ids sort chronologically.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct NoteId(pub i64);

pub const MS_PER_DAY: i64 = 86_400_000;

impl NoteId {
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        value.trim().parse::<i64>().ok().filter(|raw| *raw > 0).map(Self)
    }

    /// Day-granularity bucket of the creation timestamp. Start anchors are
    /// compared at this resolution.
    #[must_use]
    pub fn day_bucket(self) -> i64 {
        self.0.div_euclid(MS_PER_DAY)
    }

    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl Display for NoteId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// Action vocabulary of the token list produced by the organizer surface.
pub const NEW_NOTE: &str = "New";
pub const DUPE_NOTE: &str = "Dupe";
pub const DUPE_NOTE_SCHED: &str = "Dupe (sched)";
pub const DEL_NOTE: &str = "Del";
pub const SAME_NOTE_TYPE: &str = "Same note type as previous";

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ActionKind {
    New,
    Dupe,
    DupeSched,
    Del,
}

impl ActionKind {
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            NEW_NOTE => Some(Self::New),
            DUPE_NOTE => Some(Self::Dupe),
            DUPE_NOTE_SCHED => Some(Self::DupeSched),
            DEL_NOTE => Some(Self::Del),
            _ => None,
        }
    }
}

/// One item of the raw token list: either a reference to a note already in
/// the store, or an `ACTION: payload` marker.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Token {
    ExistingId(NoteId),
    Action { kind: ActionKind, payload: String },
}

impl Token {
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        if let Some(id) = NoteId::parse(raw) {
            return Some(Self::ExistingId(id));
        }
        let (action, payload) = raw.split_once(':')?;
        let kind = ActionKind::parse(action.trim())?;
        let payload = payload.trim();
        if payload.is_empty() {
            return None;
        }
        Some(Self::Action { kind, payload: payload.to_string() })
    }
}

/// Note-type selector for a `New` token: a named type, or the same type as
/// the resolved sample note.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum NoteTypeSpec {
    Named(String),
    SameAsSample,
}

/// Normalized operation, resolved once by the parser. The renumberer never
/// re-parses strings.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Operation {
    Keep(NoteId),
    Delete(NoteId),
    Create { sample: NoteId, note_type: NoteTypeSpec },
    Duplicate { sample: NoteId, carry_schedule: bool },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Malformed,
    MissingSample,
    NoteVanished,
}

/// A token dropped from the pass. Skips are non-fatal: the pass continues
/// and the caller gets the full list for reporting.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SkippedToken {
    pub index: usize,
    pub token: String,
    pub reason: SkipReason,
}

/// How the store should seed a note created from a sample.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum CreateMode {
    /// Empty fields shaped by the named type, or by the sample's type when
    /// `note_type` is `None`. Unknown named types fall back to the sample's
    /// type as well.
    Blank { note_type: Option<String> },
    /// Field-for-field clone of the sample, including its cards.
    /// `carry_schedule` copies each card's scheduling state verbatim onto
    /// its counterpart; otherwise the clone's cards start unscheduled.
    Clone { carry_schedule: bool },
}

/// The persisted collection as the rearrange engine sees it. Mutations
/// commit immediately; `renumber` must atomically cascade to the note's
/// cards.
pub trait NoteStore {
    /// Acquire the exclusive schema-modification lock for one rearrange
    /// session.
    ///
    /// # Errors
    /// Returns [`StoreError::LockUnavailable`] when another writer holds the
    /// collection; the session must then abort with zero mutations.
    fn lock_exclusive(&mut self) -> Result<(), StoreError>;

    /// Release the lock taken by [`NoteStore::lock_exclusive`].
    ///
    /// # Errors
    /// Returns an error when the backend fails to release.
    fn unlock(&mut self) -> Result<(), StoreError>;

    /// # Errors
    /// Returns an error on backend failure.
    fn exists(&self, id: NoteId) -> Result<bool, StoreError>;

    /// Create a note seeded from `sample`, returning its fresh
    /// timestamp-derived id.
    ///
    /// # Errors
    /// Returns [`StoreError::NotFound`] when the sample has vanished.
    fn create_from_sample(&mut self, sample: NoteId, mode: &CreateMode)
        -> Result<NoteId, StoreError>;

    /// Delete a note and its cards.
    ///
    /// # Errors
    /// Returns [`StoreError::NotFound`] when the note is absent.
    fn delete(&mut self, id: NoteId) -> Result<(), StoreError>;

    /// Atomically rename `old` to `new`, updating the note row and every
    /// card that references it.
    ///
    /// # Errors
    /// Returns [`StoreError::IdTaken`] when `new` is already present.
    fn renumber(&mut self, old: NoteId, new: NoteId) -> Result<(), StoreError>;

    /// Current value of the note's backup field, or `None` when the note's
    /// type does not declare one.
    ///
    /// # Errors
    /// Returns an error on backend failure.
    fn read_backup_field(&self, id: NoteId) -> Result<Option<String>, StoreError>;

    /// # Errors
    /// Returns an error on backend failure.
    fn write_backup_field(&mut self, id: NoteId, value: NoteId) -> Result<(), StoreError>;
}

/// Shared organizer settings. `backup_field` names the note field that
/// preserves a note's pre-rearrange id (`None` disables the backup write);
/// `default_note_type` seeds bootstrapped collections and is the fallback
/// for `New` tokens naming an unknown type.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct OrganizerConfig {
    #[serde(default = "default_backup_field")]
    pub backup_field: Option<String>,
    #[serde(default = "default_note_type")]
    pub default_note_type: String,
}

fn default_backup_field() -> Option<String> {
    Some("onid".to_string())
}

fn default_note_type() -> String {
    "Basic".to_string()
}

impl Default for OrganizerConfig {
    fn default() -> Self {
        Self { backup_field: default_backup_field(), default_note_type: default_note_type() }
    }
}

#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct ParsedTokens {
    pub ops: Vec<Operation>,
    pub skipped: Vec<SkippedToken>,
}

/// Normalize the raw token list into typed operations, validating every
/// referenced id against the store. Reads only; no mutation happens here.
///
/// Sample resolution for `New` tokens follows the organizer's rule: the most
/// recently resolved preceding identifier, else the next token's identifier
/// when it parses as one, else the first existing-id token later in the
/// list.
///
/// # Errors
/// Returns an error when a store existence check fails; individual bad
/// tokens are skipped, not fatal.
pub fn parse_tokens<S: NoteStore + ?Sized>(
    tokens: &[String],
    store: &S,
) -> Result<ParsedTokens, StoreError> {
    let mut parsed = ParsedTokens::default();
    let mut prev_resolved: Option<NoteId> = None;

    for (index, raw) in tokens.iter().enumerate() {
        let skip = |reason: SkipReason, parsed: &mut ParsedTokens| {
            parsed.skipped.push(SkippedToken { index, token: raw.clone(), reason });
        };

        let Some(token) = Token::parse(raw) else {
            skip(SkipReason::Malformed, &mut parsed);
            continue;
        };

        match token {
            Token::ExistingId(id) => {
                if store.exists(id)? {
                    parsed.ops.push(Operation::Keep(id));
                    prev_resolved = Some(id);
                } else {
                    skip(SkipReason::NoteVanished, &mut parsed);
                }
            }
            Token::Action { kind: ActionKind::Del, payload } => {
                match NoteId::parse(&payload) {
                    Some(id) if store.exists(id)? => parsed.ops.push(Operation::Delete(id)),
                    Some(_) => skip(SkipReason::NoteVanished, &mut parsed),
                    None => skip(SkipReason::Malformed, &mut parsed),
                }
            }
            Token::Action { kind: ActionKind::New, payload } => {
                let sample = match resolve_sample(prev_resolved, tokens, index) {
                    Some(id) if store.exists(id)? => id,
                    _ => {
                        skip(SkipReason::MissingSample, &mut parsed);
                        continue;
                    }
                };
                let note_type = if payload == SAME_NOTE_TYPE {
                    NoteTypeSpec::SameAsSample
                } else {
                    NoteTypeSpec::Named(payload)
                };
                parsed.ops.push(Operation::Create { sample, note_type });
            }
            Token::Action { kind, payload } => {
                match NoteId::parse(&payload) {
                    Some(id) if store.exists(id)? => {
                        parsed.ops.push(Operation::Duplicate {
                            sample: id,
                            carry_schedule: kind == ActionKind::DupeSched,
                        });
                        prev_resolved = Some(id);
                    }
                    Some(_) => skip(SkipReason::MissingSample, &mut parsed),
                    None => skip(SkipReason::Malformed, &mut parsed),
                }
            }
        }
    }

    Ok(parsed)
}

/// Sample for a `New` token at `index`: most recent resolved id before it,
/// else the immediately following token when it is an id, else the first
/// id-shaped token in the remaining suffix.
fn resolve_sample(
    prev_resolved: Option<NoteId>,
    tokens: &[String],
    index: usize,
) -> Option<NoteId> {
    if prev_resolved.is_some() {
        return prev_resolved;
    }
    if let Some(next) = tokens.get(index + 1) {
        if let Some(id) = NoteId::parse(next) {
            return Some(id);
        }
    }
    tokens[index + 1..].iter().find_map(|token| NoteId::parse(token))
}

/// Result of one rearrange session: pre-existing notes whose id changed,
/// notes deleted, notes created, and tokens skipped along the way.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct RearrangeOutcome {
    pub modified: Vec<NoteId>,
    pub deleted: Vec<NoteId>,
    pub created: Vec<NoteId>,
    pub skipped: Vec<SkippedToken>,
}

impl RearrangeOutcome {
    /// Ids the caller should highlight after refreshing its view.
    #[must_use]
    pub fn selection_to_restore(&self) -> Vec<NoteId> {
        selection_to_restore(&self.modified, &self.created)
    }

    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.modified.is_empty() && self.deleted.is_empty() && self.created.is_empty()
    }
}

/// Sorted, deduplicated union of moved and created ids, for restoring a
/// selection in the caller's view. Pure; no store access.
#[must_use]
pub fn selection_to_restore(modified: &[NoteId], created: &[NoteId]) -> Vec<NoteId> {
    let set: BTreeSet<NoteId> = modified.iter().chain(created.iter()).copied().collect();
    set.into_iter().collect()
}

/// `last = 0` sentinel: no identifier assigned yet in this pass.
const NO_PRIOR: NoteId = NoteId(0);

/// One rearrange session over a user-edited token list.
///
/// Owns the session state the pass accumulates: the pre-session to
/// post-session identifier map, the set of ids touched so far (for the
/// moved-block rule), and the result accumulators. Create one per session
/// and consume it with [`Rearranger::rearrange`].
pub struct Rearranger<'a, S: NoteStore + ?Sized> {
    store: &'a mut S,
    id_map: BTreeMap<NoteId, NoteId>,
    touched: BTreeSet<NoteId>,
}

impl<'a, S: NoteStore + ?Sized> Rearranger<'a, S> {
    #[must_use]
    pub fn new(store: &'a mut S) -> Self {
        Self { store, id_map: BTreeMap::new(), touched: BTreeSet::new() }
    }

    /// Run the full parse-then-renumber pass.
    ///
    /// Acquires the store's exclusive schema lock first; nothing is mutated
    /// when that fails. After the lock is held the pass runs to completion,
    /// realizing deletes, creates and renumbers in token order while keeping
    /// surviving ids strictly ascending and collision-free.
    ///
    /// `start` forces reassignment of the first surviving note when its
    /// day bucket differs from the anchor's, even absent an ordering
    /// violation.
    ///
    /// # Errors
    /// Returns [`StoreError::LockUnavailable`] when the lock cannot be
    /// taken, or the underlying store fault when a mutation fails mid-pass.
    pub fn rearrange(
        mut self,
        tokens: &[String],
        start: Option<NoteId>,
    ) -> Result<RearrangeOutcome, StoreError> {
        self.store.lock_exclusive()?;
        let result = self.run(tokens, start);
        let unlock = self.store.unlock();
        let outcome = result?;
        unlock?;
        debug!(
            modified = outcome.modified.len(),
            deleted = outcome.deleted.len(),
            created = outcome.created.len(),
            skipped = outcome.skipped.len(),
            "rearrange session committed"
        );
        Ok(outcome)
    }

    fn run(
        &mut self,
        tokens: &[String],
        start: Option<NoteId>,
    ) -> Result<RearrangeOutcome, StoreError> {
        let parsed = parse_tokens(tokens, &*self.store)?;
        let mut outcome = RearrangeOutcome { skipped: parsed.skipped, ..Default::default() };
        let mut last = NO_PRIOR;

        for (index, op) in parsed.ops.iter().enumerate() {
            let (current, is_new) = match op {
                Operation::Delete(id) => {
                    let target = self.resolve(*id);
                    self.store.delete(target)?;
                    outcome.deleted.push(*id);
                    continue;
                }
                Operation::Keep(id) => (self.resolve(*id), false),
                Operation::Create { sample, note_type } => {
                    let mode = match note_type {
                        NoteTypeSpec::Named(name) => {
                            CreateMode::Blank { note_type: Some(name.clone()) }
                        }
                        NoteTypeSpec::SameAsSample => CreateMode::Blank { note_type: None },
                    };
                    let sample = self.resolve(*sample);
                    let fresh = self.store.create_from_sample(sample, &mode)?;
                    self.touched.insert(fresh);
                    (fresh, true)
                }
                Operation::Duplicate { sample, carry_schedule } => {
                    let mode = CreateMode::Clone { carry_schedule: *carry_schedule };
                    let sample = self.resolve(*sample);
                    let fresh = self.store.create_from_sample(sample, &mode)?;
                    self.touched.insert(fresh);
                    (fresh, true)
                }
            };

            let next = self
                .next_surviving(&parsed.ops, index + 1)
                .unwrap_or_else(|| current.next());

            // Ordered in isolation; still reassigned when both neighbors
            // were touched this pass (a block moved as a whole).
            let ordered = last != NO_PRIOR && last < current && current < next;
            let block_moved =
                self.touched.contains(&current) && self.touched.contains(&next);
            if ordered && !block_moved {
                if is_new {
                    outcome.created.push(current);
                }
                last = current;
                continue;
            }

            let candidate = if last != NO_PRIOR {
                last.next()
            } else if let Some(anchor) =
                start.filter(|anchor| anchor.day_bucket() != current.day_bucket())
            {
                anchor
            } else {
                // First surviving item, no anchor change: nothing to fix.
                if is_new {
                    outcome.created.push(current);
                }
                last = current;
                continue;
            };

            let new_id = self.first_free_from(candidate)?;
            if !is_new {
                self.backup_original(current)?;
            }
            self.store.renumber(current, new_id)?;
            debug!(%last, %current, %next, %new_id, "reassigned note id");

            if let Operation::Keep(original) = op {
                self.id_map.insert(*original, new_id);
            }
            self.touched.insert(current);
            self.touched.insert(new_id);
            if is_new {
                outcome.created.push(new_id);
            } else {
                outcome.modified.push(new_id);
            }
            last = new_id;
        }

        Ok(outcome)
    }

    /// Post-session id for a pre-session reference; identity when the note
    /// has not moved this pass.
    fn resolve(&self, id: NoteId) -> NoteId {
        self.id_map.get(&id).copied().unwrap_or(id)
    }

    /// Resolved id of the next surviving token, stopping at a pending
    /// create, whose id cannot be known yet.
    fn next_surviving(&self, ops: &[Operation], from: usize) -> Option<NoteId> {
        for op in &ops[from..] {
            match op {
                Operation::Delete(_) => {}
                Operation::Keep(id) => return Some(self.resolve(*id)),
                Operation::Create { .. } | Operation::Duplicate { .. } => return None,
            }
        }
        None
    }

    /// First id at or above `candidate` not present in the store.
    fn first_free_from(&self, candidate: NoteId) -> Result<NoteId, StoreError> {
        let mut id = candidate;
        while self.store.exists(id)? {
            id = id.next();
        }
        Ok(id)
    }

    /// Preserve a pre-existing note's id in its backup field before its
    /// first displacement. The field must exist on the note's type and
    /// still be empty; a value from an earlier session is never
    /// overwritten.
    fn backup_original(&mut self, id: NoteId) -> Result<(), StoreError> {
        match self.store.read_backup_field(id)? {
            Some(existing) if existing.trim().is_empty() => {
                self.store.write_backup_field(id, id)
            }
            _ => Ok(()),
        }
    }
}
