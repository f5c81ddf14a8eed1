use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum IdentityError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("consistency violation: {0}")]
    Consistency(String),
    #[error("contact {contact} links to missing contact {missing}")]
    DanglingLink { contact: ContactId, missing: ContactId },
    #[error("linkage cycle detected while resolving contact {0}")]
    LinkCycle(ContactId),
    #[error("contact not found: {0}")]
    NotFound(ContactId),
}

impl IdentityError {
    /// Stable machine-readable code for this failure class.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::StoreUnavailable(_) => "store_unavailable",
            Self::Consistency(_) => "consistency_violation",
            Self::DanglingLink { .. } => "dangling_link",
            Self::LinkCycle(_) => "link_cycle",
            Self::NotFound(_) => "not_found",
        }
    }

    /// Whether the whole identify call may be retried unchanged.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct ContactId(pub i64);

impl Display for ContactId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LinkPrecedence {
    Primary,
    Secondary,
}

impl LinkPrecedence {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "primary" => Some(Self::Primary),
            "secondary" => Some(Self::Secondary),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub id: ContactId,
    pub email: Option<String>,
    pub phone_number: Option<String>,
    pub linked_id: Option<ContactId>,
    pub link_precedence: LinkPrecedence,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Contact {
    #[must_use]
    pub fn is_primary(&self) -> bool {
        self.link_precedence == LinkPrecedence::Primary
    }

    /// Check the per-row linkage invariants.
    ///
    /// # Errors
    /// Returns [`IdentityError::Consistency`] when both attributes are absent, a primary
    /// carries a `linked_id`, or a secondary lacks one.
    pub fn validate(&self) -> Result<(), IdentityError> {
        if self.email.is_none() && self.phone_number.is_none() {
            return Err(IdentityError::Consistency(format!(
                "contact {} has neither email nor phone_number",
                self.id
            )));
        }

        match (self.link_precedence, self.linked_id) {
            (LinkPrecedence::Primary, Some(linked_id)) => Err(IdentityError::Consistency(format!(
                "primary contact {} MUST NOT link to {linked_id}",
                self.id
            ))),
            (LinkPrecedence::Secondary, None) => Err(IdentityError::Consistency(format!(
                "secondary contact {} MUST link to a primary",
                self.id
            ))),
            _ => Ok(()),
        }
    }
}

/// Insert request handed to a [`ContactStore`]; the store assigns `id` and `created_at`.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NewContact {
    pub email: Option<String>,
    pub phone_number: Option<String>,
    pub linked_id: Option<ContactId>,
    pub link_precedence: LinkPrecedence,
}

impl NewContact {
    #[must_use]
    pub fn primary(email: Option<String>, phone_number: Option<String>) -> Self {
        Self { email, phone_number, linked_id: None, link_precedence: LinkPrecedence::Primary }
    }

    #[must_use]
    pub fn secondary(
        email: Option<String>,
        phone_number: Option<String>,
        primary_id: ContactId,
    ) -> Self {
        Self {
            email,
            phone_number,
            linked_id: Some(primary_id),
            link_precedence: LinkPrecedence::Secondary,
        }
    }

    /// # Errors
    /// Returns [`IdentityError::Validation`] when the insert would break a row invariant.
    pub fn validate(&self) -> Result<(), IdentityError> {
        if self.email.is_none() && self.phone_number.is_none() {
            return Err(IdentityError::Validation(
                "contact MUST carry an email or a phone_number".to_string(),
            ));
        }
        match (self.link_precedence, self.linked_id) {
            (LinkPrecedence::Primary, Some(_)) => Err(IdentityError::Validation(
                "primary contact MUST NOT carry linked_id".to_string(),
            )),
            (LinkPrecedence::Secondary, None) => Err(IdentityError::Validation(
                "secondary contact MUST carry linked_id".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

/// One intake fragment. At least one attribute is always present.
#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Observation {
    email: Option<String>,
    phone_number: Option<String>,
}

impl Observation {
    /// Build an observation; empty strings count as absent. Values are otherwise kept verbatim.
    ///
    /// # Errors
    /// Returns [`IdentityError::Validation`] when both email and phone number are absent.
    pub fn new(email: Option<String>, phone_number: Option<String>) -> Result<Self, IdentityError> {
        let email = email.filter(|value| !value.is_empty());
        let phone_number = phone_number.filter(|value| !value.is_empty());
        if email.is_none() && phone_number.is_none() {
            return Err(IdentityError::Validation(
                "at least one of email or phoneNumber is required".to_string(),
            ));
        }
        Ok(Self { email, phone_number })
    }

    #[must_use]
    pub fn email(&self) -> Option<&str> {
        self.email.as_deref()
    }

    #[must_use]
    pub fn phone_number(&self) -> Option<&str> {
        self.phone_number.as_deref()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConsolidatedIdentity {
    pub primary_contact_id: ContactId,
    pub emails: Vec<String>,
    pub phone_numbers: Vec<String>,
    pub secondary_contact_ids: Vec<ContactId>,
}

/// Outcome of one identify call, including every write it performed.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Resolution {
    pub identity: ConsolidatedIdentity,
    pub created: Option<ContactId>,
    pub demoted: Vec<ContactId>,
    pub relinked: Vec<ContactId>,
    pub repaired: Vec<ContactId>,
}

impl Resolution {
    #[must_use]
    pub fn wrote_anything(&self) -> bool {
        self.created.is_some()
            || !self.demoted.is_empty()
            || !self.relinked.is_empty()
            || !self.repaired.is_empty()
    }
}

/// Persistence seam consumed by the matcher and consolidator.
///
/// Every call made during one [`identify`] invocation MUST run inside the same
/// transaction so the read-modify-write is atomic with respect to other writers.
pub trait ContactStore {
    /// Contacts whose email equals `email` OR whose phone number equals `phone_number`.
    ///
    /// # Errors
    /// Returns [`IdentityError::StoreUnavailable`] when the store cannot be read.
    fn find_by_email_or_phone(
        &self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> Result<Vec<Contact>, IdentityError>;

    /// # Errors
    /// Returns [`IdentityError::StoreUnavailable`] when the store cannot be read.
    fn find_by_id(&self, id: ContactId) -> Result<Option<Contact>, IdentityError>;

    /// Contacts whose `linked_id` equals `linked_id`.
    ///
    /// # Errors
    /// Returns [`IdentityError::StoreUnavailable`] when the store cannot be read.
    fn find_by_linked_id(&self, linked_id: ContactId) -> Result<Vec<Contact>, IdentityError>;

    /// # Errors
    /// Returns [`IdentityError::Validation`] for malformed inserts, or
    /// [`IdentityError::StoreUnavailable`] when the write fails.
    fn insert_contact(&mut self, contact: NewContact) -> Result<Contact, IdentityError>;

    /// # Errors
    /// Returns [`IdentityError::NotFound`] when `id` does not exist, or
    /// [`IdentityError::StoreUnavailable`] when the write fails.
    fn update_linkage(
        &mut self,
        id: ContactId,
        linked_id: ContactId,
        precedence: LinkPrecedence,
    ) -> Result<(), IdentityError>;
}

/// Merge direction: the contact ordered first survives as primary.
///
/// This is the only ordering used to pick a surviving primary: older `created_at`
/// wins, and equal timestamps fall back to the lower `id`.
#[must_use]
pub fn primary_order(lhs: &Contact, rhs: &Contact) -> Ordering {
    lhs.created_at.cmp(&rhs.created_at).then_with(|| lhs.id.cmp(&rhs.id))
}

/// Human-readable form of [`primary_order`], published with linkage audits.
#[must_use]
pub fn merge_tie_breakers() -> Vec<String> {
    vec!["created_at asc".to_string(), "id asc".to_string()]
}

/// Matcher: every stored contact sharing the observation's email or phone number.
///
/// # Errors
/// Propagates store read failures.
pub fn match_contacts<S>(store: &S, observation: &Observation) -> Result<Vec<Contact>, IdentityError>
where
    S: ContactStore + ?Sized,
{
    let mut matches = store.find_by_email_or_phone(observation.email(), observation.phone_number())?;
    matches.sort_by(primary_order);
    matches.dedup_by_key(|contact| contact.id);
    tracing::debug!(
        matched = matches.len(),
        has_email = observation.email().is_some(),
        has_phone = observation.phone_number().is_some(),
        "matched stored contacts"
    );
    Ok(matches)
}

/// Run the matcher and consolidator for one observation.
///
/// # Errors
/// Returns store failures, or a consistency error when the stored graph cannot be repaired.
pub fn identify<S>(store: &mut S, observation: &Observation) -> Result<Resolution, IdentityError>
where
    S: ContactStore + ?Sized,
{
    let matches = match_contacts(store, observation)?;
    resolve(store, observation, &matches)
}

/// Consolidator: merge, repair and extend the identity touched by `matches`.
///
/// # Errors
/// Returns store failures, [`IdentityError::DanglingLink`] or [`IdentityError::LinkCycle`]
/// for unrepairable graphs, and [`IdentityError::Consistency`] for malformed rows.
pub fn resolve<S>(
    store: &mut S,
    observation: &Observation,
    matches: &[Contact],
) -> Result<Resolution, IdentityError>
where
    S: ContactStore + ?Sized,
{
    if matches.is_empty() {
        let created = store.insert_contact(NewContact::primary(
            observation.email.clone(),
            observation.phone_number.clone(),
        ))?;
        tracing::info!(contact_id = %created.id, "created primary contact for new identity");
        return Ok(Resolution {
            identity: assemble_identity(&created, &[]),
            created: Some(created.id),
            demoted: Vec::new(),
            relinked: Vec::new(),
            repaired: Vec::new(),
        });
    }

    let graph = collect_identity(store, matches)?;
    let Some((survivor, younger_primaries)) = graph.roots.split_first() else {
        return Err(IdentityError::Consistency("matched contacts resolved to no primary".to_string()));
    };
    let survivor = survivor.clone();
    let demoted_ids = younger_primaries.iter().map(|root| root.id).collect::<BTreeSet<_>>();

    let mut members = graph.members;
    members.remove(&survivor.id);

    let mut demoted = Vec::new();
    let mut relinked = Vec::new();
    let mut repaired = Vec::new();
    for member in members.values_mut() {
        if member.is_primary() {
            demoted.push(member.id);
        } else if member.linked_id == Some(survivor.id) {
            continue;
        } else if member.linked_id.is_some_and(|linked_id| demoted_ids.contains(&linked_id)) {
            relinked.push(member.id);
        } else {
            tracing::warn!(
                contact_id = %member.id,
                stale_link = ?member.linked_id,
                primary_id = %survivor.id,
                "flattening chained secondary link"
            );
            repaired.push(member.id);
        }

        store.update_linkage(member.id, survivor.id, LinkPrecedence::Secondary)?;
        member.linked_id = Some(survivor.id);
        member.link_precedence = LinkPrecedence::Secondary;
    }

    if !demoted.is_empty() {
        tracing::info!(
            primary_id = %survivor.id,
            demoted = ?demoted,
            relinked = relinked.len(),
            "merged identities under oldest primary"
        );
    }

    let mut secondaries = members.into_values().collect::<Vec<_>>();
    secondaries.sort_by(primary_order);

    let is_new_email = observation.email().is_some_and(|email| {
        survivor.email.as_deref() != Some(email)
            && !secondaries.iter().any(|contact| contact.email.as_deref() == Some(email))
    });
    let is_new_phone = observation.phone_number().is_some_and(|phone| {
        survivor.phone_number.as_deref() != Some(phone)
            && !secondaries.iter().any(|contact| contact.phone_number.as_deref() == Some(phone))
    });

    let mut created = None;
    if is_new_email || is_new_phone {
        let contact = store.insert_contact(NewContact::secondary(
            if is_new_email { observation.email.clone() } else { None },
            if is_new_phone { observation.phone_number.clone() } else { None },
            survivor.id,
        ))?;
        tracing::info!(
            contact_id = %contact.id,
            primary_id = %survivor.id,
            new_email = is_new_email,
            new_phone = is_new_phone,
            "linked new secondary contact"
        );
        created = Some(contact.id);
        secondaries.push(contact);
    }

    Ok(Resolution {
        identity: assemble_identity(&survivor, &secondaries),
        created,
        demoted,
        relinked,
        repaired,
    })
}

/// Read-only consolidated view of the identity that contains `id`.
///
/// # Errors
/// Returns [`IdentityError::NotFound`] for unknown ids and the same graph errors as [`resolve`].
pub fn identity_of<S>(store: &S, id: ContactId) -> Result<ConsolidatedIdentity, IdentityError>
where
    S: ContactStore + ?Sized,
{
    let contact = store.find_by_id(id)?.ok_or(IdentityError::NotFound(id))?;
    let graph = collect_identity(store, std::slice::from_ref(&contact))?;
    let Some(primary) = graph.roots.first() else {
        return Err(IdentityError::Consistency(format!("contact {id} resolved to no primary")));
    };
    let mut secondaries = graph
        .members
        .into_values()
        .filter(|member| member.id != primary.id)
        .collect::<Vec<_>>();
    secondaries.sort_by(primary_order);
    Ok(assemble_identity(primary, &secondaries))
}

/// Contacts reachable from a seed set: their primaries and everything linked beneath them.
#[derive(Debug)]
struct IdentityGraph {
    roots: Vec<Contact>,
    members: BTreeMap<ContactId, Contact>,
}

fn collect_identity<S>(store: &S, seeds: &[Contact]) -> Result<IdentityGraph, IdentityError>
where
    S: ContactStore + ?Sized,
{
    let mut members: BTreeMap<ContactId, Contact> = BTreeMap::new();
    for seed in seeds {
        seed.validate()?;
        members.insert(seed.id, seed.clone());
    }

    let mut roots: BTreeMap<ContactId, Contact> = BTreeMap::new();
    for seed in seeds {
        let root = walk_to_root(store, &mut members, seed)?;
        roots.insert(root.id, root);
    }

    let mut expanded = BTreeSet::new();
    let mut frontier = members.keys().copied().collect::<Vec<_>>();
    while let Some(id) = frontier.pop() {
        if !expanded.insert(id) {
            continue;
        }
        for dependent in store.find_by_linked_id(id)? {
            dependent.validate()?;
            frontier.push(dependent.id);
            members.entry(dependent.id).or_insert(dependent);
        }
    }

    let mut roots = roots.into_values().collect::<Vec<_>>();
    roots.sort_by(primary_order);
    Ok(IdentityGraph { roots, members })
}

fn walk_to_root<S>(
    store: &S,
    cache: &mut BTreeMap<ContactId, Contact>,
    start: &Contact,
) -> Result<Contact, IdentityError>
where
    S: ContactStore + ?Sized,
{
    let mut visited = BTreeSet::from([start.id]);
    let mut current = start.clone();

    while !current.is_primary() {
        let Some(next_id) = current.linked_id else {
            return Err(IdentityError::Consistency(format!(
                "secondary contact {} MUST link to a primary",
                current.id
            )));
        };
        if !visited.insert(next_id) {
            tracing::error!(contact_id = %start.id, "linkage cycle detected");
            return Err(IdentityError::LinkCycle(start.id));
        }

        let next = if let Some(cached) = cache.get(&next_id) {
            cached.clone()
        } else {
            let Some(fetched) = store.find_by_id(next_id)? else {
                tracing::error!(contact_id = %current.id, missing = %next_id, "dangling linked_id");
                return Err(IdentityError::DanglingLink { contact: current.id, missing: next_id });
            };
            fetched.validate()?;
            cache.insert(fetched.id, fetched.clone());
            fetched
        };
        current = next;
    }

    Ok(current)
}

fn assemble_identity(primary: &Contact, secondaries: &[Contact]) -> ConsolidatedIdentity {
    let mut emails: Vec<String> = Vec::new();
    let mut phone_numbers: Vec<String> = Vec::new();

    for contact in std::iter::once(primary).chain(secondaries) {
        if let Some(email) = &contact.email {
            if !emails.contains(email) {
                emails.push(email.clone());
            }
        }
        if let Some(phone) = &contact.phone_number {
            if !phone_numbers.contains(phone) {
                phone_numbers.push(phone.clone());
            }
        }
    }

    ConsolidatedIdentity {
        primary_contact_id: primary.id,
        emails,
        phone_numbers,
        secondary_contact_ids: secondaries.iter().map(|contact| contact.id).collect(),
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    MissingAttributes,
    PrimaryWithLink,
    SecondaryWithoutLink,
    DanglingLink,
    ChainedLink,
    MultiplePrimaries,
    NoPrimary,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct LinkageViolation {
    pub kind: ViolationKind,
    pub contact_ids: Vec<ContactId>,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct LinkageReport {
    pub contacts: usize,
    pub primaries: usize,
    pub components: usize,
    /// Ordering that decides which primary survives a merge.
    pub tie_breakers: Vec<String>,
    pub violations: Vec<LinkageViolation>,
}

impl LinkageReport {
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.violations.is_empty()
    }
}

struct DisjointSet {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl DisjointSet {
    fn new(size: usize) -> Self {
        Self { parent: (0..size).collect(), rank: vec![0; size] }
    }

    fn find(&mut self, index: usize) -> usize {
        let mut root = index;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        let mut cursor = index;
        while self.parent[cursor] != root {
            let next = self.parent[cursor];
            self.parent[cursor] = root;
            cursor = next;
        }
        root
    }

    fn union(&mut self, lhs: usize, rhs: usize) {
        let lhs = self.find(lhs);
        let rhs = self.find(rhs);
        if lhs == rhs {
            return;
        }
        match self.rank[lhs].cmp(&self.rank[rhs]) {
            Ordering::Less => self.parent[lhs] = rhs,
            Ordering::Greater => self.parent[rhs] = lhs,
            Ordering::Equal => {
                self.parent[rhs] = lhs;
                self.rank[lhs] = self.rank[lhs].saturating_add(1);
            }
        }
    }
}

/// Audit a full contact listing against the linkage invariants.
///
/// Components are the union of shared-email, shared-phone and `linked_id` edges;
/// each one must hold exactly one primary and every secondary must point at it directly.
#[must_use]
pub fn audit_linkage(contacts: &[Contact]) -> LinkageReport {
    let index_by_id = contacts
        .iter()
        .enumerate()
        .map(|(index, contact)| (contact.id, index))
        .collect::<BTreeMap<_, _>>();
    let mut violations = Vec::new();
    let mut sets = DisjointSet::new(contacts.len());
    let mut first_by_email: BTreeMap<&str, usize> = BTreeMap::new();
    let mut first_by_phone: BTreeMap<&str, usize> = BTreeMap::new();

    for (index, contact) in contacts.iter().enumerate() {
        if contact.email.is_none() && contact.phone_number.is_none() {
            violations.push(LinkageViolation {
                kind: ViolationKind::MissingAttributes,
                contact_ids: vec![contact.id],
                detail: "contact has neither email nor phone_number".to_string(),
            });
        }
        if let Some(email) = contact.email.as_deref() {
            let first = *first_by_email.entry(email).or_insert(index);
            sets.union(first, index);
        }
        if let Some(phone) = contact.phone_number.as_deref() {
            let first = *first_by_phone.entry(phone).or_insert(index);
            sets.union(first, index);
        }

        match (contact.link_precedence, contact.linked_id) {
            (LinkPrecedence::Primary, Some(linked_id)) => violations.push(LinkageViolation {
                kind: ViolationKind::PrimaryWithLink,
                contact_ids: vec![contact.id],
                detail: format!("primary links to {linked_id}"),
            }),
            (LinkPrecedence::Secondary, None) => violations.push(LinkageViolation {
                kind: ViolationKind::SecondaryWithoutLink,
                contact_ids: vec![contact.id],
                detail: "secondary has no linked_id".to_string(),
            }),
            (_, Some(linked_id)) => match index_by_id.get(&linked_id) {
                None => violations.push(LinkageViolation {
                    kind: ViolationKind::DanglingLink,
                    contact_ids: vec![contact.id],
                    detail: format!("linked_id {linked_id} does not exist"),
                }),
                Some(&target) => {
                    sets.union(index, target);
                    if !contacts[target].is_primary() {
                        violations.push(LinkageViolation {
                            kind: ViolationKind::ChainedLink,
                            contact_ids: vec![contact.id, linked_id],
                            detail: format!("secondary links to secondary {linked_id}"),
                        });
                    }
                }
            },
            (LinkPrecedence::Primary, None) => {}
        }
    }

    let mut components: BTreeMap<usize, Vec<&Contact>> = BTreeMap::new();
    for (index, contact) in contacts.iter().enumerate() {
        components.entry(sets.find(index)).or_default().push(contact);
    }

    for members in components.values() {
        let primaries = members
            .iter()
            .filter(|contact| contact.is_primary())
            .map(|contact| contact.id)
            .collect::<Vec<_>>();
        match primaries.len() {
            0 => violations.push(LinkageViolation {
                kind: ViolationKind::NoPrimary,
                contact_ids: members.iter().map(|contact| contact.id).collect(),
                detail: "connected component has no primary".to_string(),
            }),
            1 => {}
            count => violations.push(LinkageViolation {
                kind: ViolationKind::MultiplePrimaries,
                contact_ids: primaries,
                detail: format!("connected component has {count} primaries"),
            }),
        }
    }

    LinkageReport {
        contacts: contacts.len(),
        primaries: contacts.iter().filter(|contact| contact.is_primary()).count(),
        components: components.len(),
        tie_breakers: merge_tie_breakers(),
        violations,
    }
}

/// In-memory [`ContactStore`] with a logical clock that ticks one second per insert.
#[derive(Debug, Clone)]
pub struct MemoryContactStore {
    contacts: BTreeMap<ContactId, Contact>,
    next_id: i64,
    clock: OffsetDateTime,
}

impl Default for MemoryContactStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryContactStore {
    #[must_use]
    pub fn new() -> Self {
        Self::starting_at(OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000))
    }

    #[must_use]
    pub fn starting_at(clock: OffsetDateTime) -> Self {
        Self { contacts: BTreeMap::new(), next_id: 1, clock }
    }

    /// Insert a row verbatim, bypassing validation. Used to stage damaged graphs.
    pub fn seed(&mut self, contact: Contact) {
        self.next_id = self.next_id.max(contact.id.0 + 1);
        if contact.created_at > self.clock {
            self.clock = contact.created_at;
        }
        self.contacts.insert(contact.id, contact);
    }

    #[must_use]
    pub fn contacts(&self) -> Vec<Contact> {
        self.contacts.values().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }
}

impl ContactStore for MemoryContactStore {
    fn find_by_email_or_phone(
        &self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> Result<Vec<Contact>, IdentityError> {
        Ok(self
            .contacts
            .values()
            .filter(|contact| {
                (email.is_some() && contact.email.as_deref() == email)
                    || (phone_number.is_some() && contact.phone_number.as_deref() == phone_number)
            })
            .cloned()
            .collect())
    }

    fn find_by_id(&self, id: ContactId) -> Result<Option<Contact>, IdentityError> {
        Ok(self.contacts.get(&id).cloned())
    }

    fn find_by_linked_id(&self, linked_id: ContactId) -> Result<Vec<Contact>, IdentityError> {
        Ok(self
            .contacts
            .values()
            .filter(|contact| contact.linked_id == Some(linked_id))
            .cloned()
            .collect())
    }

    fn insert_contact(&mut self, contact: NewContact) -> Result<Contact, IdentityError> {
        contact.validate()?;
        self.clock += Duration::seconds(1);
        let stored = Contact {
            id: ContactId(self.next_id),
            email: contact.email,
            phone_number: contact.phone_number,
            linked_id: contact.linked_id,
            link_precedence: contact.link_precedence,
            created_at: self.clock,
        };
        self.next_id += 1;
        self.contacts.insert(stored.id, stored.clone());
        Ok(stored)
    }

    fn update_linkage(
        &mut self,
        id: ContactId,
        linked_id: ContactId,
        precedence: LinkPrecedence,
    ) -> Result<(), IdentityError> {
        let contact = self.contacts.get_mut(&id).ok_or(IdentityError::NotFound(id))?;
        contact.linked_id = Some(linked_id);
        contact.link_precedence = precedence;
        Ok(())
    }
}
