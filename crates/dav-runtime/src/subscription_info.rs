//! Subscription state of one data identification
//!
//! Each data identification carries two independent streams:
//! - the source stream, anchored by a source, consumed by receivers
//! - the drain stream, anchored by a drain, fed by senders
//!
//! The anchor makes its distributor the central distributor of the stream.
//! Distributors without the anchor search for it by subscribing toward the
//! potential central distributors; every hop answers with a receipt naming
//! the central distributor it found. Two different claims lock the stream.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use dav_core::{
    BaseSubscriptionInfo, ConnectionId, ConnectionState, DavError, DavResult, DistributorId,
    ReceiptCode, ReceiverState, SenderState, TransmitterSubscriptionType, UserId,
};
use dav_wire::{
    join_fragments, split_data, DataTelegram, ReceiptTelegram, SubscriptionTelegram, Telegram,
    UnsubscriptionTelegram, MAX_DATA_FRAGMENT_SIZE,
};

use crate::{AccessControl, PotentialCentralDistributors, RouteLookup, TransmitterLink};

/// Role of a local application subscription
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LocalRole {
    /// Exclusive publisher, anchors the source stream
    Source,
    /// Publishes toward the drain
    Sender,
    /// Exclusive consumer, anchors the drain stream
    Drain,
    /// Consumes from the source
    Receiver,
}

impl LocalRole {
    /// Stream the role belongs to, named by what remote subscriptions for it
    /// look for
    pub fn kind(self) -> TransmitterSubscriptionType {
        match self {
            LocalRole::Source | LocalRole::Receiver => TransmitterSubscriptionType::Receiver,
            LocalRole::Drain | LocalRole::Sender => TransmitterSubscriptionType::Sender,
        }
    }

    pub fn is_anchor(self) -> bool {
        matches!(self, LocalRole::Source | LocalRole::Drain)
    }

    pub fn is_sending(self) -> bool {
        matches!(self, LocalRole::Source | LocalRole::Sender)
    }

    /// Role a remote subscription of `kind` is checked against
    pub fn for_remote(kind: TransmitterSubscriptionType) -> Self {
        match kind {
            TransmitterSubscriptionType::Receiver => LocalRole::Receiver,
            TransmitterSubscriptionType::Sender => LocalRole::Sender,
        }
    }
}

static NEXT_LOCAL_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalSubscriptionId(pub u64);

impl LocalSubscriptionId {
    pub fn next() -> Self {
        LocalSubscriptionId(NEXT_LOCAL_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Debug for LocalSubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Local#{}", self.0)
    }
}

/// Application side of a local subscription
pub trait LocalSubscriber: Send + Sync {
    fn data(&self, _info: BaseSubscriptionInfo, _data_index: u64, _payload: Bytes) {}

    fn sender_state(&self, _info: BaseSubscriptionInfo, _state: SenderState) {}

    fn receiver_state(&self, _info: BaseSubscriptionInfo, _state: ReceiverState) {}
}

/// Who is authoritative for a stream, as seen from this distributor
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CentralState {
    Unknown,
    /// This distributor holds the anchor
    Local,
    /// Found behind the given link
    Remote {
        central: DistributorId,
        via: ConnectionId,
    },
    /// Conflicting claims, no data is forwarded
    Locked,
}

impl CentralState {
    pub fn central_id(self, local: DistributorId) -> Option<DistributorId> {
        match self {
            CentralState::Local => Some(local),
            CentralState::Remote { central, .. } => Some(central),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Reported {
    Sender(SenderState),
    Receiver(ReceiverState),
}

pub struct LocalSubscription {
    pub id: LocalSubscriptionId,
    pub role: LocalRole,
    pub user: UserId,
    pub subscriber: Arc<dyn LocalSubscriber>,
    allowed: bool,
    reported: Option<Reported>,
}

/// Subscription a neighbour sent us
pub struct RemoteSubscription {
    pub link: Arc<dyn TransmitterLink>,
    /// Potential central distributors the neighbour looks for
    pub distributors: Vec<DistributorId>,
    sent_receipt: Option<(ReceiptCode, Option<DistributorId>)>,
}

impl RemoteSubscription {
    /// Last receipt we sent for this subscription
    pub fn sent_receipt(&self) -> Option<(ReceiptCode, Option<DistributorId>)> {
        self.sent_receipt
    }

    fn is_served_by(&self, central: DistributorId) -> bool {
        self.sent_receipt == Some((ReceiptCode::Positive, Some(central)))
    }
}

/// Subscription we sent to a neighbour in search of the central distributor
pub struct OutgoingSubscription {
    pub link: Arc<dyn TransmitterLink>,
    pub targets: Vec<DistributorId>,
    pub state: ConnectionState,
    pub central: Option<DistributorId>,
}

/// One stream of a data identification
pub struct StreamState {
    pub central: CentralState,
    central_allowed: bool,
    waiting: bool,
    /// Elected central and the link toward it, once every other search
    /// came back empty
    narrowed: Option<(DistributorId, ConnectionId)>,
    pub locals: Vec<LocalSubscription>,
    pub remotes: HashMap<ConnectionId, RemoteSubscription>,
    pub outgoing: HashMap<ConnectionId, OutgoingSubscription>,
}

impl StreamState {
    fn new() -> Self {
        StreamState {
            central: CentralState::Unknown,
            central_allowed: true,
            waiting: false,
            narrowed: None,
            locals: Vec::new(),
            remotes: HashMap::new(),
            outgoing: HashMap::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.locals.is_empty() && self.remotes.is_empty() && self.outgoing.is_empty()
    }
}

/// Side effect of a state change, executed after the lock was released
pub(crate) enum Action {
    Send(Arc<dyn TransmitterLink>, Telegram),
    SenderState(Arc<dyn LocalSubscriber>, BaseSubscriptionInfo, SenderState),
    ReceiverState(Arc<dyn LocalSubscriber>, BaseSubscriptionInfo, ReceiverState),
    Deliver(Arc<dyn LocalSubscriber>, BaseSubscriptionInfo, u64, Bytes),
}

/// What an evaluation may consult
pub(crate) struct Evaluation<'a> {
    pub local: DistributorId,
    pub routes: &'a dyn RouteLookup,
    pub potential: &'a dyn PotentialCentralDistributors,
    pub access: &'a dyn AccessControl,
}

/// Subscriptions of one data identification
pub struct SubscriptionInfo {
    base: BaseSubscriptionInfo,
    source_stream: StreamState,
    drain_stream: StreamState,
    last_index: u64,
    last_received: u64,
}

impl SubscriptionInfo {
    /// `index_base` is where generated data indexes start
    pub fn new(base: BaseSubscriptionInfo, index_base: u64) -> Self {
        SubscriptionInfo {
            base,
            source_stream: StreamState::new(),
            drain_stream: StreamState::new(),
            last_index: index_base,
            last_received: 0,
        }
    }

    pub fn base(&self) -> BaseSubscriptionInfo {
        self.base
    }

    pub fn stream(&self, kind: TransmitterSubscriptionType) -> &StreamState {
        match kind {
            TransmitterSubscriptionType::Receiver => &self.source_stream,
            TransmitterSubscriptionType::Sender => &self.drain_stream,
        }
    }

    fn stream_mut(&mut self, kind: TransmitterSubscriptionType) -> &mut StreamState {
        match kind {
            TransmitterSubscriptionType::Receiver => &mut self.source_stream,
            TransmitterSubscriptionType::Sender => &mut self.drain_stream,
        }
    }

    pub fn central(&self, kind: TransmitterSubscriptionType) -> CentralState {
        self.stream(kind).central
    }

    pub fn is_empty(&self) -> bool {
        self.source_stream.is_empty() && self.drain_stream.is_empty()
    }

    /// Hand out the next data index
    pub fn next_data_index(&mut self) -> u64 {
        self.last_index = self.last_index.max(self.last_received) + 1;
        self.last_index
    }

    pub fn current_data_index(&self) -> u64 {
        self.last_index
    }

    /// Highest index accepted from upstream
    pub fn last_received_index(&self) -> u64 {
        self.last_received
    }

    pub fn add_local(
        &mut self,
        role: LocalRole,
        user: UserId,
        subscriber: Arc<dyn LocalSubscriber>,
    ) -> DavResult<LocalSubscriptionId> {
        let stream = self.stream_mut(role.kind());
        if role.is_anchor() && stream.locals.iter().any(|l| l.role == role) {
            return Err(DavError::SubscriptionConflict(format!(
                "{:?} of {} already subscribed",
                role, self.base
            )));
        }
        let id = LocalSubscriptionId::next();
        stream.locals.push(LocalSubscription {
            id,
            role,
            user,
            subscriber,
            allowed: true,
            reported: None,
        });
        Ok(id)
    }

    pub fn remove_local(&mut self, id: LocalSubscriptionId) -> bool {
        for stream in [&mut self.source_stream, &mut self.drain_stream] {
            if let Some(pos) = stream.locals.iter().position(|l| l.id == id) {
                stream.locals.remove(pos);
                return true;
            }
        }
        false
    }

    fn local(&self, id: LocalSubscriptionId) -> Option<&LocalSubscription> {
        self.source_stream
            .locals
            .iter()
            .chain(self.drain_stream.locals.iter())
            .find(|l| l.id == id)
    }

    /// Add or update the subscription of a neighbour
    pub fn update_remote(
        &mut self,
        link: Arc<dyn TransmitterLink>,
        kind: TransmitterSubscriptionType,
        distributors: Vec<DistributorId>,
    ) {
        let conn = link.connection_id();
        let stream = self.stream_mut(kind);
        match stream.remotes.get_mut(&conn) {
            Some(remote) if remote.distributors == distributors => {}
            Some(remote) => {
                remote.distributors = distributors;
                remote.sent_receipt = None;
            }
            None => {
                stream.remotes.insert(
                    conn,
                    RemoteSubscription {
                        link,
                        distributors,
                        sent_receipt: None,
                    },
                );
            }
        }
    }

    pub fn remove_remote(&mut self, conn: ConnectionId, kind: TransmitterSubscriptionType) -> bool {
        self.stream_mut(kind).remotes.remove(&conn).is_some()
    }

    /// Forget everything that went over a lost link
    pub fn remove_connection(&mut self, conn: ConnectionId) {
        for stream in [&mut self.source_stream, &mut self.drain_stream] {
            stream.remotes.remove(&conn);
            stream.outgoing.remove(&conn);
        }
    }

    /// Receipt for one of our outgoing subscriptions. False if there is no
    /// such subscription.
    pub fn handle_receipt(
        &mut self,
        conn: ConnectionId,
        kind: TransmitterSubscriptionType,
        code: ReceiptCode,
        central: Option<DistributorId>,
    ) -> bool {
        match self.stream_mut(kind).outgoing.get_mut(&conn) {
            Some(outgoing) => {
                outgoing.state = ConnectionState::from_receipt(code);
                outgoing.central = central;
                true
            }
            None => false,
        }
    }

    /// Recompute both streams
    pub(crate) fn evaluate(&mut self, ctx: &Evaluation<'_>, actions: &mut Vec<Action>) {
        let base = self.base;
        for kind in [TransmitterSubscriptionType::Receiver, TransmitterSubscriptionType::Sender] {
            let before = self.stream(kind).central.central_id(ctx.local);
            evaluate_stream(base, kind, self.stream_mut(kind), ctx, actions);
            let after = self.stream(kind).central.central_id(ctx.local);
            if kind == TransmitterSubscriptionType::Receiver && before != after {
                self.last_received = 0;
            }
        }
    }

    /// Data from a local source or sender
    pub(crate) fn publish_local(
        &mut self,
        local: DistributorId,
        id: LocalSubscriptionId,
        payload: Bytes,
        actions: &mut Vec<Action>,
    ) -> DavResult<u64> {
        let Some(subscription) = self.local(id) else {
            return Err(DavError::SubscriptionConflict(format!(
                "no local subscription {:?} for {}",
                id, self.base
            )));
        };
        if !subscription.allowed {
            return Err(DavError::SubscriptionConflict(format!(
                "{:?} of {} is not allowed",
                subscription.role, self.base
            )));
        }
        let base = self.base;
        match subscription.role {
            LocalRole::Source => {
                if self.source_stream.central != CentralState::Local {
                    return Err(DavError::SubscriptionConflict(format!(
                        "source of {} is not central ({:?})",
                        base, self.source_stream.central
                    )));
                }
                let index = self.next_data_index();
                let fragments = split_data(base, index, false, 0, payload.clone(), MAX_DATA_FRAGMENT_SIZE)?;
                deliver_downstream(base, &self.source_stream, local, None, index, &payload, &fragments, actions);
                Ok(index)
            }
            LocalRole::Sender => match self.drain_stream.central {
                CentralState::Local => {
                    let index = self.next_data_index();
                    deliver_to_drain(base, &self.drain_stream, index, payload, actions);
                    Ok(index)
                }
                CentralState::Remote { via, .. } if self.drain_stream.central_allowed => {
                    let link = self
                        .drain_stream
                        .outgoing
                        .get(&via)
                        .map(|o| o.link.clone())
                        .ok_or_else(|| DavError::IllegalState(format!("no link toward the drain of {}", base)))?;
                    for fragment in split_data(base, 0, true, 0, payload, MAX_DATA_FRAGMENT_SIZE)? {
                        actions.push(Action::Send(link.clone(), Telegram::Data(fragment)));
                    }
                    Ok(0)
                }
                other => Err(DavError::SubscriptionConflict(format!(
                    "no drain available for {} ({:?})",
                    base, other
                ))),
            },
            role => Err(DavError::SubscriptionConflict(format!(
                "{:?} subscription cannot send",
                role
            ))),
        }
    }

    /// Complete data packet from a neighbour
    pub(crate) fn handle_data(
        &mut self,
        local: DistributorId,
        from: ConnectionId,
        fragments: Vec<DataTelegram>,
        actions: &mut Vec<Action>,
    ) -> DavResult<()> {
        let Some(first) = fragments.first() else {
            return Ok(());
        };
        let base = self.base;

        if !first.toward_central {
            let central = match self.source_stream.central {
                CentralState::Remote { central, via } if via == from => central,
                other => {
                    return Err(DavError::IllegalState(format!(
                        "data for {} from {} does not come from the central distributor ({:?})",
                        base, from, other
                    )))
                }
            };
            let index = first.data_index;
            if index <= self.last_received {
                return Err(DavError::IllegalState(format!(
                    "data index {} of {} not above {}",
                    index, base, self.last_received
                )));
            }
            let payload = join_fragments(&fragments)?;
            self.last_received = index;
            deliver_downstream(base, &self.source_stream, central, Some(from), index, &payload, &fragments, actions);
            return Ok(());
        }

        let served = self
            .drain_stream
            .remotes
            .get(&from)
            .and_then(|r| r.sent_receipt)
            .and_then(|(code, central)| (code == ReceiptCode::Positive).then_some(central).flatten());
        let expected = self.drain_stream.central.central_id(local);
        if served.is_none() || served != expected {
            return Err(DavError::IllegalState(format!(
                "data for {} from {} without an accepted sender subscription",
                base, from
            )));
        }
        match self.drain_stream.central {
            CentralState::Local => {
                let payload = join_fragments(&fragments)?;
                let index = self.next_data_index();
                deliver_to_drain(base, &self.drain_stream, index, payload, actions);
                Ok(())
            }
            CentralState::Remote { via, .. } if via != from => {
                let link = self
                    .drain_stream
                    .outgoing
                    .get(&via)
                    .map(|o| o.link.clone())
                    .ok_or_else(|| DavError::IllegalState(format!("no link toward the drain of {}", base)))?;
                for fragment in fragments {
                    actions.push(Action::Send(link.clone(), Telegram::Data(fragment)));
                }
                Ok(())
            }
            other => Err(DavError::IllegalState(format!(
                "data for {} cannot be forwarded ({:?})",
                base, other
            ))),
        }
    }
}

fn deliver_downstream(
    base: BaseSubscriptionInfo,
    stream: &StreamState,
    central: DistributorId,
    from: Option<ConnectionId>,
    index: u64,
    payload: &Bytes,
    fragments: &[DataTelegram],
    actions: &mut Vec<Action>,
) {
    for local in stream.locals.iter().filter(|l| l.allowed && l.role == LocalRole::Receiver) {
        actions.push(Action::Deliver(local.subscriber.clone(), base, index, payload.clone()));
    }
    for (conn, remote) in &stream.remotes {
        if Some(*conn) == from || !remote.is_served_by(central) {
            continue;
        }
        for fragment in fragments {
            actions.push(Action::Send(remote.link.clone(), Telegram::Data(fragment.clone())));
        }
    }
}

fn deliver_to_drain(
    base: BaseSubscriptionInfo,
    stream: &StreamState,
    index: u64,
    payload: Bytes,
    actions: &mut Vec<Action>,
) {
    for local in stream.locals.iter().filter(|l| l.allowed && l.role == LocalRole::Drain) {
        actions.push(Action::Deliver(local.subscriber.clone(), base, index, payload.clone()));
    }
}

fn evaluate_stream(
    base: BaseSubscriptionInfo,
    kind: TransmitterSubscriptionType,
    stream: &mut StreamState,
    ctx: &Evaluation<'_>,
    actions: &mut Vec<Action>,
) {
    let local = ctx.local;
    for subscription in &mut stream.locals {
        subscription.allowed = ctx.access.is_allowed(subscription.user, &base, subscription.role);
    }
    let has_anchor = stream.locals.iter().any(|l| l.allowed && l.role.is_anchor());
    let local_interest = stream.locals.iter().any(|l| l.allowed);

    // A narrowed search holds while the elected central keeps its route
    let narrowed = stream.narrowed.filter(|(central, via)| {
        stream.central == CentralState::Remote { central: *central, via: *via }
            && ctx.routes.best_link(*central).map(|l| l.connection_id()) == Some(*via)
    });
    stream.narrowed = narrowed;
    let desired = desired_searches(base, stream, ctx, local_interest, narrowed);
    update_searches(base, kind, stream, desired, actions);

    // Election over everything we know
    let mut claims: BTreeMap<DistributorId, (Option<ConnectionId>, bool)> = BTreeMap::new();
    if has_anchor {
        claims.insert(local, (None, true));
    }
    let mut multiple = false;
    let mut waiting = false;
    for (conn, outgoing) in &stream.outgoing {
        match outgoing.state {
            ConnectionState::ToRemoteOk | ConnectionState::ToRemoteNotAllowed => {
                let Some(central) = outgoing.central else { continue };
                if central == local || !outgoing.targets.contains(&central) {
                    continue;
                }
                let allowed = outgoing.state == ConnectionState::ToRemoteOk;
                let best = ctx.routes.best_link(central).map(|l| l.connection_id());
                match claims.get(&central) {
                    Some(_) if best != Some(*conn) => {}
                    _ => {
                        claims.insert(central, (Some(*conn), allowed));
                    }
                }
            }
            ConnectionState::ToRemoteMultiple => multiple = true,
            ConnectionState::ToRemoteWaiting => waiting = true,
            ConnectionState::ToRemoteNotResponsible => {}
        }
    }
    let (central, allowed) = if multiple || claims.len() > 1 {
        (CentralState::Locked, true)
    } else {
        match claims.into_iter().next() {
            Some((_, (None, _))) => (CentralState::Local, true),
            Some((central, (Some(via), allowed))) => (CentralState::Remote { central, via }, allowed),
            None => (CentralState::Unknown, true),
        }
    };
    if central != stream.central {
        match central {
            CentralState::Locked => tracing::warn!(
                info = %base,
                "{:?} stream locked, more than one central distributor claimed",
                kind
            ),
            _ => tracing::debug!(info = %base, "{:?} stream central {:?} -> {:?}", kind, stream.central, central),
        }
        stream.central = central;
    }
    stream.central_allowed = allowed;
    stream.waiting = waiting;

    // Once every other search came back empty only the link toward the
    // elected central keeps our own subscription
    match (stream.central, stream.narrowed) {
        (CentralState::Remote { central, via }, None) if others_settled(stream, via) => {
            tracing::trace!(info = %base, "{:?} search narrowed to {}", kind, via);
            stream.narrowed = Some((central, via));
            let desired = desired_searches(base, stream, ctx, local_interest, stream.narrowed);
            update_searches(base, kind, stream, desired, actions);
        }
        (CentralState::Remote { central, via }, Some(narrowed)) if narrowed == (central, via) => {}
        (_, Some(_)) => {
            // The elected central is gone, search every potential central again
            stream.narrowed = None;
            evaluate_stream(base, kind, stream, ctx, actions);
            return;
        }
        _ => {}
    }

    // Receipts, each from what the other links told us
    let mut receipts = Vec::new();
    for (conn, remote) in &stream.remotes {
        let mut found: BTreeMap<DistributorId, bool> = BTreeMap::new();
        if has_anchor && remote.distributors.contains(&local) {
            let allowed = ctx
                .access
                .is_allowed(remote.link.user_id(), &base, LocalRole::for_remote(kind));
            found.insert(local, allowed);
        }
        let mut multiple = false;
        let mut waiting = false;
        for (other, outgoing) in &stream.outgoing {
            if other == conn {
                continue;
            }
            let overlaps = outgoing.targets.iter().any(|t| remote.distributors.contains(t));
            match outgoing.state {
                ConnectionState::ToRemoteOk | ConnectionState::ToRemoteNotAllowed => {
                    if let Some(central) = outgoing.central {
                        if central != local
                            && outgoing.targets.contains(&central)
                            && remote.distributors.contains(&central)
                        {
                            found
                                .entry(central)
                                .or_insert(outgoing.state == ConnectionState::ToRemoteOk);
                        }
                    }
                }
                ConnectionState::ToRemoteMultiple if overlaps => multiple = true,
                ConnectionState::ToRemoteWaiting if overlaps => waiting = true,
                _ => {}
            }
        }
        let receipt = if multiple || found.len() > 1 {
            Some((ReceiptCode::MoreThanOnePositive, None))
        } else if let Some((central, allowed)) = found.into_iter().next() {
            let code = if allowed {
                ReceiptCode::Positive
            } else {
                ReceiptCode::PositiveNoRight
            };
            Some((code, Some(central)))
        } else if waiting {
            None
        } else {
            Some((ReceiptCode::Negative, None))
        };
        if let Some(receipt) = receipt {
            if remote.sent_receipt != Some(receipt) {
                receipts.push((*conn, receipt));
            }
        }
    }
    for (conn, (code, central)) in receipts {
        if let Some(remote) = stream.remotes.get_mut(&conn) {
            remote.sent_receipt = Some((code, central));
            actions.push(Action::Send(
                remote.link.clone(),
                Telegram::SubscriptionReceipt(ReceiptTelegram {
                    info: base,
                    kind,
                    code,
                    central,
                }),
            ));
        }
    }

    // Local application states
    let central_id = stream.central.central_id(local);
    let served_remotes = central_id
        .map(|c| stream.remotes.values().filter(|r| r.is_served_by(c)).count())
        .unwrap_or(0);
    let local_consumers = stream
        .locals
        .iter()
        .filter(|l| l.allowed && !l.role.is_anchor())
        .count();
    let counterparts = served_remotes + local_consumers;
    let (central, central_allowed, waiting) = (stream.central, stream.central_allowed, stream.waiting);

    for subscription in &mut stream.locals {
        let state = local_state(subscription, central, central_allowed, waiting, counterparts);
        if subscription.reported == Some(state) {
            continue;
        }
        subscription.reported = Some(state);
        let subscriber = subscription.subscriber.clone();
        actions.push(match state {
            Reported::Sender(s) => Action::SenderState(subscriber, base, s),
            Reported::Receiver(s) => Action::ReceiverState(subscriber, base, s),
        });
    }
}

type Searches = HashMap<ConnectionId, (Arc<dyn TransmitterLink>, Vec<DistributorId>)>;

/// Outgoing subscriptions per link. In a narrowed search the interest in
/// the elected central only travels over the link toward it; searches of
/// neighbours that look for other distributors are still forwarded.
fn desired_searches(
    base: BaseSubscriptionInfo,
    stream: &StreamState,
    ctx: &Evaluation<'_>,
    local_interest: bool,
    narrowed: Option<(DistributorId, ConnectionId)>,
) -> Searches {
    let local = ctx.local;

    // Targets and who wants them; `None` is local interest
    let mut wanted: BTreeMap<DistributorId, BTreeSet<Option<ConnectionId>>> = BTreeMap::new();
    if local_interest {
        for target in ctx.potential.potential_centrals(&base) {
            if target != local {
                wanted.entry(target).or_default().insert(None);
            }
        }
    }
    for (conn, remote) in &stream.remotes {
        for target in &remote.distributors {
            if *target != local {
                wanted.entry(*target).or_default().insert(Some(*conn));
            }
        }
    }

    let served: BTreeSet<Option<ConnectionId>> = match narrowed {
        Some((central, _)) => std::iter::once(None)
            .chain(
                stream
                    .remotes
                    .iter()
                    .filter(|(_, r)| r.distributors.contains(&central))
                    .map(|(conn, _)| Some(*conn)),
            )
            .collect(),
        None => BTreeSet::new(),
    };

    let mut desired = Searches::new();
    for (target, mut sources) in wanted {
        let Some(link) = ctx.routes.best_link(target) else {
            continue;
        };
        let conn = link.connection_id();
        if narrowed.map_or(false, |(_, via)| via != conn) {
            sources.retain(|s| !served.contains(s));
        }
        // Never ask a neighbour on its own behalf
        if sources.iter().all(|s| *s == Some(conn)) {
            continue;
        }
        desired.entry(conn).or_insert_with(|| (link, Vec::new())).1.push(target);
    }
    desired
}

/// Bring the outgoing subscriptions in line with `desired`
fn update_searches(
    base: BaseSubscriptionInfo,
    kind: TransmitterSubscriptionType,
    stream: &mut StreamState,
    desired: Searches,
    actions: &mut Vec<Action>,
) {
    let stale: Vec<ConnectionId> = stream
        .outgoing
        .keys()
        .filter(|c| !desired.contains_key(c))
        .copied()
        .collect();
    for conn in stale {
        if let Some(outgoing) = stream.outgoing.remove(&conn) {
            actions.push(Action::Send(
                outgoing.link,
                Telegram::Unsubscription(UnsubscriptionTelegram { info: base, kind }),
            ));
        }
    }
    for (conn, (link, targets)) in desired {
        let send = match stream.outgoing.get_mut(&conn) {
            Some(outgoing) if outgoing.targets == targets => false,
            Some(outgoing) => {
                if !outgoing.central.map_or(false, |c| targets.contains(&c)) {
                    outgoing.state = ConnectionState::ToRemoteWaiting;
                    outgoing.central = None;
                }
                outgoing.targets = targets.clone();
                true
            }
            None => {
                stream.outgoing.insert(
                    conn,
                    OutgoingSubscription {
                        link: link.clone(),
                        targets: targets.clone(),
                        state: ConnectionState::ToRemoteWaiting,
                        central: None,
                    },
                );
                true
            }
        };
        if send {
            actions.push(Action::Send(
                link,
                Telegram::Subscription(SubscriptionTelegram {
                    info: base,
                    kind,
                    distributors: targets,
                }),
            ));
        }
    }
}

/// Whether every outgoing subscription beside `via` was answered negatively
fn others_settled(stream: &StreamState, via: ConnectionId) -> bool {
    stream
        .outgoing
        .iter()
        .all(|(conn, o)| *conn == via || o.state == ConnectionState::ToRemoteNotResponsible)
}

fn local_state(
    subscription: &LocalSubscription,
    central: CentralState,
    central_allowed: bool,
    waiting: bool,
    counterparts: usize,
) -> Reported {
    let role = subscription.role;
    if !subscription.allowed {
        return if role.is_sending() {
            Reported::Sender(SenderState::NotAllowed)
        } else {
            Reported::Receiver(ReceiverState::NotAllowed)
        };
    }
    match role {
        LocalRole::Source => Reported::Sender(match central {
            CentralState::Local if counterparts > 0 => SenderState::ReceiversAvailable,
            CentralState::Local => SenderState::NoReceivers,
            CentralState::Locked => SenderState::MultipleRemoteLock,
            _ => SenderState::InvalidSubscription,
        }),
        LocalRole::Drain => Reported::Receiver(match central {
            CentralState::Local if counterparts > 0 => ReceiverState::SendersAvailable,
            CentralState::Local => ReceiverState::NoSenders,
            CentralState::Locked => ReceiverState::MultipleRemoteLock,
            _ => ReceiverState::InvalidSubscription,
        }),
        LocalRole::Sender => Reported::Sender(match central {
            CentralState::Local => SenderState::ReceiversAvailable,
            CentralState::Remote { .. } if central_allowed => SenderState::ReceiversAvailable,
            CentralState::Remote { .. } => SenderState::NotAllowed,
            CentralState::Locked => SenderState::MultipleRemoteLock,
            CentralState::Unknown if waiting => SenderState::Waiting,
            CentralState::Unknown => SenderState::NoRemoteDrain,
        }),
        LocalRole::Receiver => Reported::Receiver(match central {
            CentralState::Local => ReceiverState::SendersAvailable,
            CentralState::Remote { .. } if central_allowed => ReceiverState::SendersAvailable,
            CentralState::Remote { .. } => ReceiverState::NotAllowed,
            CentralState::Locked => ReceiverState::MultipleRemoteLock,
            CentralState::Unknown if waiting => ReceiverState::Waiting,
            CentralState::Unknown => ReceiverState::NoRemoteSource,
        }),
    }
}
