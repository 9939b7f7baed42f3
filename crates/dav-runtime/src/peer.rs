//! Peer connection state machine
//!
//! One [`PeerConnection`] per link to a neighbouring distributor. Its
//! dispatch task reads the channel in wire order and serves the server side
//! of every handshake step. The client side runs in whatever task
//! establishes the link and receives its answers through [`PendingReplies`].
//!
//! Outgoing links:
//! 1. propose protocol versions
//! 2. log in (SRP from version 3 on, keyed digest before) and switch on encryption
//! 3. optionally switch encryption off again on trusted links
//! 4. wait until the remote distributor logged in here as well
//! 5. negotiate keep-alive parameters
//!
//! Incoming links serve these steps and log in at the remote distributor as
//! soon as it logged in here. Routed telegrams that arrive before the link
//! is ready are queued and replayed by [`PeerConnection::complete_initialisation`].

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime};

use parking_lot::Mutex;
use tokio::sync::{watch, Notify};

use dav_core::{
    BaseSubscriptionInfo, CommunicationState, ConnectionId, DavError, DavResult, DistributorId, LinkDirection, UserId,
};
use dav_crypto::{
    legacy_digest, AuthenticationTextComponent, ChannelRole, ClientCredentials, FakeVerifierSource, LoginThrottler,
    SrpAuthenticator, SrpClient, SrpServerSession, VerifierStore, LEGACY_PROCESS_NAME,
};
use dav_transport::{ChannelEvent, ChannelEvents, TelegramChannel};
use dav_wire::{ComParameters, DataTelegram, Telegram, TelegramKind};

use crate::handshake::{
    check_negotiated, clamp_com_parameters, com_parameters, preferred_version, wait_reply, PendingReplies,
};
use crate::{
    Aggregation, DistributorConfig, EncryptionPolicy, NodeCounters, TelegramAggregator, TransmitterLink,
    DEFAULT_WEIGHT, SRP_PROTOCOL_VERSION,
};

/// Handshake settings of a distributor
#[derive(Clone, Debug)]
pub struct PeerSettings {
    pub local: DistributorId,
    pub protocol_versions: Vec<i32>,
    /// Bounded wait for each synchronous answer
    pub handshake_timeout: Duration,
    pub send_keep_alive: Duration,
    pub receive_keep_alive: Duration,
    pub disabled_grace: Duration,
    pub allow_legacy_authentication: bool,
    pub encryption: EncryptionPolicy,
}

impl PeerSettings {
    pub fn from_config(config: &DistributorConfig) -> Self {
        PeerSettings {
            local: config.local_id(),
            protocol_versions: config.protocol_versions.clone(),
            handshake_timeout: config.handshake_timeout,
            send_keep_alive: config.send_keep_alive,
            receive_keep_alive: config.receive_keep_alive,
            disabled_grace: config.disabled_grace,
            allow_legacy_authentication: config.allow_legacy_authentication,
            encryption: config.encryption,
        }
    }

    /// Deadline for a link to get ready
    fn setup_deadline(&self) -> Duration {
        self.handshake_timeout * 4
    }
}

/// Shared by all peer connections of a distributor
pub struct PeerContext {
    pub settings: PeerSettings,
    srp: SrpAuthenticator,
    texts: AuthenticationTextComponent,
    throttle: LoginThrottler,
    counters: Arc<NodeCounters>,
}

impl PeerContext {
    pub fn new(settings: PeerSettings, store: Arc<dyn VerifierStore>, counters: Arc<NodeCounters>) -> Self {
        PeerContext {
            settings,
            srp: SrpAuthenticator::new(store, Arc::new(FakeVerifierSource::new())),
            texts: AuthenticationTextComponent::new(),
            throttle: LoginThrottler::default(),
            counters,
        }
    }

    pub fn with_throttle(mut self, throttle: LoginThrottler) -> Self {
        self.throttle = throttle;
        self
    }

    pub fn counters(&self) -> &Arc<NodeCounters> {
        &self.counters
    }
}

/// What a connection needs from the distributor that owns it
pub trait PeerHost: Send + Sync {
    /// `connection` authenticated `remote`. An error rejects the connection
    /// with the given explanation. Called again for the same connection
    /// when both directions completed.
    fn claim_identity(&self, connection: &Arc<PeerConnection>, remote: DistributorId) -> Result<(), String>;

    fn is_disabled(&self, remote: DistributorId) -> bool;

    fn weight_for(&self, remote: DistributorId) -> u32;

    /// Login to use at `remote`
    fn credentials_for(&self, remote: DistributorId) -> Option<ClientCredentials>;

    /// Handshake complete. The host registers the link and calls
    /// [`PeerConnection::complete_initialisation`].
    fn ready(&self, connection: &Arc<PeerConnection>);

    fn routed_telegram(&self, connection: &Arc<PeerConnection>, telegram: Telegram);

    /// Complete, ordered fragments of one data packet
    fn data_received(&self, connection: &Arc<PeerConnection>, fragments: Vec<DataTelegram>);

    /// Called exactly once per connection
    fn terminated(&self, connection: &Arc<PeerConnection>, error: bool, reason: &str);
}

/// Status of one connection
#[derive(Clone, Debug)]
pub struct PeerStatus {
    pub connection: ConnectionId,
    pub remote: Option<DistributorId>,
    pub direction: LinkDirection,
    pub state: CommunicationState,
    pub address: Option<SocketAddr>,
    pub encrypted: bool,
    pub message: Option<String>,
    pub created_at: SystemTime,
}

struct PeerState {
    communication: CommunicationState,
    remote: Option<DistributorId>,
    user: UserId,
    weight: u32,
    version: Option<i32>,
    srp_session: Option<SrpServerSession>,
    /// Logged in by SRP, transmitter request pending
    srp_user: Option<String>,
    legacy_requester: Option<DistributorId>,
    server_authenticated: bool,
    client_authenticated: bool,
    parameters_received: bool,
    disabled: bool,
    ready_signalled: bool,
    initialised: bool,
    early: VecDeque<Telegram>,
    message: Option<String>,
}

/// Live link to a neighbouring distributor
pub struct PeerConnection {
    id: ConnectionId,
    direction: LinkDirection,
    context: Arc<PeerContext>,
    host: Weak<dyn PeerHost>,
    channel: Arc<dyn TelegramChannel>,
    replies: PendingReplies,
    state: Mutex<PeerState>,
    remote_authenticated: watch::Sender<Option<bool>>,
    aggregator: Mutex<TelegramAggregator<(BaseSubscriptionInfo, bool)>>,
    terminated: AtomicBool,
    /// Wakes the dispatch task, a local close produces no channel event
    closing: Notify,
    created: Instant,
    created_at: SystemTime,
}

impl PeerConnection {
    /// Take over `channel` and start dispatching its events
    pub fn start(
        context: Arc<PeerContext>,
        host: Weak<dyn PeerHost>,
        channel: Arc<dyn TelegramChannel>,
        events: ChannelEvents,
        direction: LinkDirection,
    ) -> Arc<Self> {
        let (remote_authenticated, _) = watch::channel(None);
        let deadline = context.settings.setup_deadline();
        let connection = Arc::new(PeerConnection {
            id: ConnectionId::next(),
            direction,
            context,
            host,
            channel,
            replies: PendingReplies::new(),
            state: Mutex::new(PeerState {
                communication: CommunicationState::Connecting,
                remote: None,
                user: UserId::SYSTEM,
                weight: DEFAULT_WEIGHT,
                version: None,
                srp_session: None,
                srp_user: None,
                legacy_requester: None,
                server_authenticated: false,
                client_authenticated: false,
                parameters_received: false,
                disabled: false,
                ready_signalled: false,
                initialised: false,
                early: VecDeque::new(),
                message: None,
            }),
            remote_authenticated,
            aggregator: Mutex::new(TelegramAggregator::new()),
            terminated: AtomicBool::new(false),
            closing: Notify::new(),
            created: Instant::now(),
            created_at: SystemTime::now(),
        });

        tokio::spawn(connection.clone().run(events));

        let watched = Arc::downgrade(&connection);
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            if let Some(connection) = watched.upgrade() {
                if !connection.is_initialised() {
                    connection.terminate(true, "link setup not completed in time");
                }
            }
        });
        connection
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn direction(&self) -> LinkDirection {
        self.direction
    }

    pub fn remote(&self) -> Option<DistributorId> {
        self.state.lock().remote
    }

    pub fn communication_state(&self) -> CommunicationState {
        self.state.lock().communication
    }

    pub fn protocol_version(&self) -> Option<i32> {
        self.state.lock().version
    }

    pub fn is_initialised(&self) -> bool {
        self.state.lock().initialised
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    pub fn is_encrypted(&self) -> bool {
        self.channel.is_encrypted()
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.channel.remote_addr()
    }

    pub fn status(&self) -> PeerStatus {
        let state = self.state.lock();
        PeerStatus {
            connection: self.id,
            remote: state.remote,
            direction: self.direction,
            state: state.communication,
            address: self.channel.remote_addr(),
            encrypted: self.channel.is_encrypted(),
            message: state.message.clone(),
            created_at: self.created_at,
        }
    }

    /// Run the client side of the handshake toward `expected`. Returns the
    /// id the remote distributor answered with.
    pub async fn establish(self: &Arc<Self>, expected: DistributorId) -> DavResult<DistributorId> {
        let version = self.negotiate_version().await?;
        let remote = match self.authenticate_as_client(expected, version).await {
            Ok(remote) => remote,
            Err(e) => {
                if matches!(e, DavError::AuthenticationFailed(_) | DavError::InconsistentLogin(_)) {
                    self.context.counters.authentication_failed();
                }
                return Err(e);
            }
        };
        if remote != expected {
            tracing::warn!(
                connection = %self.id,
                "connected to distributor {} instead of the configured {}",
                remote,
                expected
            );
        }
        let known = self.state.lock().remote;
        if let Some(known) = known {
            if known != remote {
                return Err(DavError::InconsistentLogin(format!(
                    "distributor {} logged in here as {}",
                    remote, known
                )));
            }
        }

        let host = self.host()?;
        if let Err(reason) = host.claim_identity(self, remote) {
            self.context.counters.duplicate_rejected();
            return Err(DavError::ConnectionTerminated(reason));
        }
        {
            let mut state = self.state.lock();
            state.remote = Some(remote);
            state.weight = host.weight_for(remote);
            state.client_authenticated = true;
        }

        self.wait_remote_authenticated().await?;
        self.exchange_com_parameters().await?;

        self.state.lock().ready_signalled = true;
        host.ready(self);
        Ok(remote)
    }

    /// Mark the link usable and replay the telegrams that arrived early
    pub fn complete_initialisation(self: &Arc<Self>) {
        loop {
            let next = {
                let mut state = self.state.lock();
                match state.early.pop_front() {
                    Some(telegram) => telegram,
                    None => {
                        if !state.initialised {
                            state.initialised = true;
                            state.communication = CommunicationState::Connected;
                        }
                        break;
                    }
                }
            };
            self.route(next);
        }
        self.context.counters.connection_established();
        tracing::info!(connection = %self.id, remote = ?self.remote(), "link ready");
    }

    /// Round trip of a telegram-time exchange, `None` if it failed
    pub async fn measure_round_trip(&self) -> Option<Duration> {
        let start = self.created.elapsed().as_micros() as u64;
        let answer = self
            .request(Telegram::TelegramTimeRequest { start_time: start }, TelegramKind::TelegramTimeAnswer)
            .await
            .ok()?;
        match answer {
            Telegram::TelegramTimeAnswer { start_time } if start_time == start => {
                Some(self.created.elapsed().saturating_sub(Duration::from_micros(start)))
            }
            _ => None,
        }
    }

    /// End the link; the remote side is told why. Further calls do nothing.
    pub fn terminate(self: &Arc<Self>, error: bool, reason: &str) {
        self.shutdown(error, reason, true);
    }

    fn shutdown(self: &Arc<Self>, error: bool, reason: &str, notify_remote: bool) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        let remote = {
            let mut state = self.state.lock();
            state.communication = CommunicationState::Disconnecting;
            state.message = Some(reason.to_string());
            state.early.clear();
            state.srp_session = None;
            state.remote
        };
        if error {
            tracing::warn!(connection = %self.id, remote = ?remote, "connection terminated: {}", reason);
        } else {
            tracing::info!(connection = %self.id, remote = ?remote, "connection closed: {}", reason);
        }

        if notify_remote {
            let message = reason.to_string();
            let telegram = if error {
                Telegram::TerminateOrder { message }
            } else {
                Telegram::Closing { message }
            };
            if let Err(e) = self.channel.send(telegram) {
                tracing::debug!(connection = %self.id, "termination not sent: {}", e);
            }
        }
        self.channel.close();
        self.closing.notify_one();
        self.replies.close();
        self.remote_authenticated.send_replace(Some(false));
        self.aggregator.lock().clear();

        if let Some(host) = self.host.upgrade() {
            host.terminated(self, error, reason);
        }
        self.state.lock().communication = if error {
            CommunicationState::Error
        } else {
            CommunicationState::NotConnected
        };
        self.context.counters.connection_terminated();
    }

    async fn run(self: Arc<Self>, mut events: ChannelEvents) {
        loop {
            let event = tokio::select! {
                event = events.recv() => event,
                _ = self.closing.notified() => None,
            };
            let Some(event) = event else {
                break;
            };
            match event {
                ChannelEvent::Telegram(telegram) => self.dispatch(telegram).await,
                ChannelEvent::Closed(reason) => {
                    let error = reason.is_some();
                    let reason = reason.unwrap_or_else(|| "closed by remote distributor".to_string());
                    self.shutdown(error, &reason, false);
                }
            }
            if self.is_terminated() {
                break;
            }
        }
        self.shutdown(true, "channel ended", false);
    }

    async fn dispatch(self: &Arc<Self>, telegram: Telegram) {
        let telegram = match self.replies.deliver(telegram) {
            Ok(()) => return,
            Err(telegram) => telegram,
        };
        match telegram {
            Telegram::KeepAlive => {}
            Telegram::ProtocolVersionRequest { versions } => self.handle_version_request(&versions),
            Telegram::SrpRequest {
                user,
                one_time_index,
                a,
            } => self.handle_srp_request(user, one_time_index, a).await,
            Telegram::SrpValidateRequest { m1 } => self.handle_srp_validate(&m1),
            Telegram::DisableEncryptionRequest => self.handle_disable_encryption(),
            Telegram::TransmitterRequest { distributor } => self.handle_transmitter_request(distributor),
            Telegram::AuthenticationTextRequest { distributor } => self.handle_text_request(distributor),
            Telegram::AuthenticationRequest {
                process,
                user,
                encrypted_password,
            } => self.handle_legacy_login(process, user, encrypted_password).await,
            Telegram::ComParametersRequest(parameters) => self.handle_com_parameters(parameters),
            Telegram::TelegramTimeRequest { start_time } => {
                self.send_or_log(Telegram::TelegramTimeAnswer { start_time })
            }
            Telegram::TerminateOrder { message } => {
                self.shutdown(true, &format!("terminated by remote distributor: {}", message), false)
            }
            Telegram::Closing { message } => self.shutdown(false, &message, false),
            telegram if telegram.kind().is_early() => self.receive_routed(telegram),
            other => tracing::debug!(connection = %self.id, "unexpected {:?} ignored", other.kind()),
        }
    }

    fn receive_routed(self: &Arc<Self>, telegram: Telegram) {
        {
            let mut state = self.state.lock();
            if !state.initialised {
                state.early.push_back(telegram);
                return;
            }
        }
        self.route(telegram);
    }

    fn route(self: &Arc<Self>, telegram: Telegram) {
        let Some(host) = self.host.upgrade() else {
            return;
        };
        match telegram {
            Telegram::Data(fragment) => {
                let key = (fragment.info, fragment.toward_central);
                let outcome = self.aggregator.lock().aggregate(key, fragment);
                match outcome {
                    Aggregation::Complete(fragments) => host.data_received(self, fragments),
                    Aggregation::Pending => {}
                    Aggregation::Discarded => self.context.counters.fragment_error(),
                }
            }
            other => host.routed_telegram(self, other),
        }
    }

    // Server side

    fn handle_version_request(&self, versions: &[i32]) {
        let version = preferred_version(&self.context.settings.protocol_versions, versions);
        if version < 0 {
            tracing::warn!(
                connection = %self.id,
                "no common protocol version, remote proposed {:?}",
                versions
            );
        } else {
            let mut state = self.state.lock();
            state.version = Some(version);
            state.communication = CommunicationState::Authenticating;
        }
        self.send_or_log(Telegram::ProtocolVersionAnswer { version });
    }

    async fn handle_srp_request(self: &Arc<Self>, user: String, one_time_index: i32, a: Vec<u8>) {
        let (authenticated, version) = {
            let state = self.state.lock();
            (state.server_authenticated, state.version)
        };
        if authenticated {
            self.protocol_violation("second login on an authenticated link");
            return;
        }
        if version.map_or(true, |v| v < SRP_PROTOCOL_VERSION) {
            self.protocol_violation("SRP login without negotiating an SRP protocol version");
            return;
        }
        if one_time_index != -1 {
            self.terminate(true, "distributors must log in with their permanent password");
            return;
        }
        self.wait_for_throttle().await;

        match self.context.srp.start(&user, None, &a) {
            Ok(challenge) => {
                self.state.lock().srp_session = Some(challenge.session);
                self.send_or_log(Telegram::SrpAnswer {
                    salt: challenge.salt,
                    b: challenge.b,
                });
            }
            Err(e) => self.terminate(true, &format!("login of user {} failed: {}", user, e)),
        }
    }

    fn handle_srp_validate(self: &Arc<Self>, m1: &[u8]) {
        let session = self.state.lock().srp_session.take();
        let Some(session) = session else {
            self.protocol_violation("SRP validation without request");
            return;
        };
        match self.context.srp.finish(session, m1) {
            Ok(success) => {
                self.context.throttle.record(true);
                tracing::debug!(connection = %self.id, "user {} logged in", success.user);
                self.state.lock().srp_user = Some(success.user);
                self.send_or_log(Telegram::SrpValidateAnswer { m2: success.m2 });
                if self.direction == LinkDirection::Incoming {
                    if let Err(e) = self.channel.enable_encryption(success.key, ChannelRole::Server) {
                        self.terminate(true, &format!("encryption not enabled: {}", e));
                    }
                }
            }
            Err(e) => {
                self.context.throttle.record(false);
                self.context.counters.authentication_failed();
                tracing::warn!(connection = %self.id, "login failed: {}", e);
                self.send_or_log(Telegram::SrpValidateAnswer { m2: Vec::new() });
            }
        }
    }

    fn handle_disable_encryption(self: &Arc<Self>) {
        let allowed =
            self.channel.is_encrypted() && self.context.settings.encryption.allows_disable(self.channel.is_loopback());
        self.send_or_log(Telegram::DisableEncryptionAnswer { disabled: allowed });
        if allowed {
            match self.channel.disable_encryption() {
                Ok(()) => tracing::info!(connection = %self.id, "encryption switched off"),
                Err(e) => self.terminate(true, &format!("encryption not disabled: {}", e)),
            }
        }
    }

    fn handle_transmitter_request(self: &Arc<Self>, distributor: DistributorId) {
        let user = self.state.lock().srp_user.take();
        match user {
            Some(user) => self.complete_authentication(distributor, &user),
            None => self.protocol_violation("transmitter request before login"),
        }
    }

    fn handle_text_request(self: &Arc<Self>, distributor: DistributorId) {
        if !self.context.settings.allow_legacy_authentication {
            self.terminate(true, &DavError::LegacyAuthenticationDisabled.to_string());
            return;
        }
        if self.state.lock().server_authenticated {
            self.protocol_violation("second login on an authenticated link");
            return;
        }
        self.state.lock().legacy_requester = Some(distributor);
        let text = self.context.texts.text_for(&distributor.to_string());
        self.send_or_log(Telegram::AuthenticationTextAnswer { text });
    }

    async fn handle_legacy_login(self: &Arc<Self>, process: String, user: String, digest: Vec<u8>) {
        if !self.context.settings.allow_legacy_authentication {
            self.terminate(true, &DavError::LegacyAuthenticationDisabled.to_string());
            return;
        }
        let requester = self.state.lock().legacy_requester.take();
        let Some(requester) = requester else {
            self.protocol_violation("login without authentication text");
            return;
        };
        self.wait_for_throttle().await;

        let password = self.context.srp.store().legacy_password(&user);
        // The text is used up either way
        let matches = self.context.texts.authenticate(
            &requester.to_string(),
            &process,
            password.as_deref().unwrap_or_default(),
            &digest,
        );
        let success = matches && password.is_some();
        self.context.throttle.record(success);
        if success {
            self.complete_authentication(requester, &user);
        } else {
            self.context.counters.authentication_failed();
            tracing::warn!(connection = %self.id, "legacy login of user {} failed", user);
            self.send_or_log(Telegram::AuthenticationAnswer {
                success: false,
                distributor: None,
            });
        }
    }

    /// The remote distributor proved who it is
    fn complete_authentication(self: &Arc<Self>, remote: DistributorId, user: &str) {
        let Ok(host) = self.host() else {
            return;
        };
        let known = {
            let state = self.state.lock();
            if state.server_authenticated {
                drop(state);
                self.protocol_violation("second login on an authenticated link");
                return;
            }
            state.remote
        };
        if let Some(known) = known {
            if known != remote {
                let e = DavError::InconsistentLogin(format!("distributor {} logged in as {}", known, remote));
                self.terminate(true, &e.to_string());
                return;
            }
        }
        if let Err(reason) = host.claim_identity(self, remote) {
            self.context.counters.duplicate_rejected();
            self.terminate(true, &reason);
            return;
        }

        let disabled = host.is_disabled(remote);
        {
            let mut state = self.state.lock();
            state.remote = Some(remote);
            state.user = self.context.srp.store().user_id(user).unwrap_or(UserId::SYSTEM);
            state.weight = host.weight_for(remote);
            state.server_authenticated = true;
            state.disabled = disabled;
        }
        self.send_or_log(Telegram::AuthenticationAnswer {
            success: true,
            distributor: Some(self.context.settings.local),
        });

        if disabled {
            let grace = self.context.settings.disabled_grace;
            tracing::warn!(
                connection = %self.id,
                "distributor {} is disabled, terminating in {}",
                remote,
                humantime::format_duration(grace)
            );
            let connection = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                connection.terminate(true, &format!("distributor {} is disabled", remote));
            });
            return;
        }

        self.remote_authenticated.send_replace(Some(true));
        if self.direction == LinkDirection::Incoming {
            let connection = self.clone();
            tokio::spawn(async move {
                if let Err(e) = connection.reverse_authentication(remote).await {
                    connection.terminate(true, &format!("login at distributor {} failed: {}", remote, e));
                }
            });
        }
    }

    fn handle_com_parameters(self: &Arc<Self>, requested: ComParameters) {
        if !self.state.lock().server_authenticated {
            self.protocol_violation("communication parameters before login");
            return;
        }
        let parameters = clamp_com_parameters(requested);
        self.send_or_log(Telegram::ComParametersAnswer(parameters));
        self.apply_com_parameters(&parameters);
        self.state.lock().parameters_received = true;
        self.try_ready();
    }

    /// Incoming links are ready once both logins and the parameters are done
    fn try_ready(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            let complete = state.server_authenticated && state.client_authenticated && state.parameters_received;
            if self.direction != LinkDirection::Incoming || state.ready_signalled || state.disabled || !complete {
                return;
            }
            state.ready_signalled = true;
        }
        if let Ok(host) = self.host() {
            host.ready(self);
        }
    }

    // Client side

    async fn negotiate_version(&self) -> DavResult<i32> {
        let versions = self.context.settings.protocol_versions.clone();
        let answer = self
            .request(
                Telegram::ProtocolVersionRequest {
                    versions: versions.clone(),
                },
                TelegramKind::ProtocolVersionAnswer,
            )
            .await?;
        let Telegram::ProtocolVersionAnswer { version } = answer else {
            return Err(unexpected(&answer));
        };
        let version = check_negotiated(version, &versions)?;
        let mut state = self.state.lock();
        state.version = Some(version);
        state.communication = CommunicationState::Authenticating;
        Ok(version)
    }

    async fn authenticate_as_client(&self, expected: DistributorId, version: i32) -> DavResult<DistributorId> {
        let credentials = self
            .host()?
            .credentials_for(expected)
            .ok_or_else(|| DavError::MissingCredentials(format!("login at distributor {}", expected)))?;

        if version < SRP_PROTOCOL_VERSION {
            if !self.context.settings.allow_legacy_authentication {
                return Err(DavError::LegacyAuthenticationDisabled);
            }
            return self.legacy_login(&credentials).await;
        }

        self.srp_login(&credentials).await?;
        if self.direction == LinkDirection::Outgoing
            && self.context.settings.encryption.allows_disable(self.channel.is_loopback())
        {
            self.request_disable_encryption().await?;
        }
        let answer = self
            .request(
                Telegram::TransmitterRequest {
                    distributor: self.context.settings.local,
                },
                TelegramKind::AuthenticationAnswer,
            )
            .await?;
        login_result(answer)
    }

    async fn srp_login(&self, credentials: &ClientCredentials) -> DavResult<()> {
        let client = SrpClient::new(&credentials.user);
        let answer = self
            .request(
                Telegram::SrpRequest {
                    user: credentials.user.clone(),
                    one_time_index: -1,
                    a: client.public_ephemeral(),
                },
                TelegramKind::SrpAnswer,
            )
            .await?;
        let Telegram::SrpAnswer { salt, b } = answer else {
            return Err(unexpected(&answer));
        };
        let proof = client.process_challenge(&credentials.password, &salt, &b)?;

        let answer = self
            .request(
                Telegram::SrpValidateRequest { m1: proof.m1.clone() },
                TelegramKind::SrpValidateAnswer,
            )
            .await?;
        let Telegram::SrpValidateAnswer { m2 } = answer else {
            return Err(unexpected(&answer));
        };
        let key = proof.verify_server(&m2)?;
        if self.direction == LinkDirection::Outgoing {
            self.channel.enable_encryption(key, ChannelRole::Client)?;
        }
        Ok(())
    }

    async fn legacy_login(&self, credentials: &ClientCredentials) -> DavResult<DistributorId> {
        let answer = self
            .request(
                Telegram::AuthenticationTextRequest {
                    distributor: self.context.settings.local,
                },
                TelegramKind::AuthenticationTextAnswer,
            )
            .await?;
        let Telegram::AuthenticationTextAnswer { text } = answer else {
            return Err(unexpected(&answer));
        };
        let answer = self
            .request(
                Telegram::AuthenticationRequest {
                    process: LEGACY_PROCESS_NAME.to_string(),
                    user: credentials.user.clone(),
                    encrypted_password: legacy_digest(&credentials.password, &text),
                },
                TelegramKind::AuthenticationAnswer,
            )
            .await?;
        login_result(answer)
    }

    async fn request_disable_encryption(&self) -> DavResult<()> {
        let answer = self
            .request(Telegram::DisableEncryptionRequest, TelegramKind::DisableEncryptionAnswer)
            .await?;
        match answer {
            Telegram::DisableEncryptionAnswer { disabled: true } => {
                self.channel.disable_encryption()?;
                tracing::info!(connection = %self.id, "encryption switched off");
            }
            _ => tracing::debug!(connection = %self.id, "remote distributor keeps the link encrypted"),
        }
        Ok(())
    }

    async fn wait_remote_authenticated(&self) -> DavResult<()> {
        let mut rx = self.remote_authenticated.subscribe();
        let timeout = self.context.settings.handshake_timeout;
        let outcome = match tokio::time::timeout(timeout, rx.wait_for(|v| v.is_some())).await {
            Ok(Ok(value)) => *value,
            Ok(Err(_)) => None,
            Err(_) => {
                return Err(DavError::Timeout(format!(
                    "remote distributor did not log in within {}",
                    humantime::format_duration(timeout)
                )))
            }
        };
        match outcome {
            Some(true) => Ok(()),
            _ => Err(DavError::ConnectionTerminated(
                "connection terminated while waiting for the remote login".into(),
            )),
        }
    }

    async fn reverse_authentication(self: &Arc<Self>, remote: DistributorId) -> DavResult<()> {
        let version = self
            .protocol_version()
            .ok_or_else(|| DavError::IllegalState("login without protocol version".into()))?;
        let answered = self.authenticate_as_client(remote, version).await?;
        if answered != remote {
            return Err(DavError::InconsistentLogin(format!(
                "distributor {} answered as {}",
                remote, answered
            )));
        }
        self.state.lock().client_authenticated = true;
        self.try_ready();
        Ok(())
    }

    async fn exchange_com_parameters(&self) -> DavResult<()> {
        let settings = &self.context.settings;
        let requested = com_parameters(settings.send_keep_alive, settings.receive_keep_alive);
        let answer = self
            .request(Telegram::ComParametersRequest(requested), TelegramKind::ComParametersAnswer)
            .await?;
        let Telegram::ComParametersAnswer(parameters) = answer else {
            return Err(unexpected(&answer));
        };
        self.apply_com_parameters(&parameters);
        Ok(())
    }

    // Helpers

    async fn request(&self, telegram: Telegram, expected: TelegramKind) -> DavResult<Telegram> {
        let rx = self.replies.register(expected)?;
        self.channel.send(telegram)?;
        wait_reply(rx, self.context.settings.handshake_timeout, expected).await
    }

    fn apply_com_parameters(&self, parameters: &ComParameters) {
        self.channel.set_keep_alive(
            Duration::from_millis(parameters.send_keep_alive_ms),
            Duration::from_millis(parameters.receive_keep_alive_ms),
        );
    }

    async fn wait_for_throttle(&self) {
        let delay = self.context.throttle.pending_delay();
        if !delay.is_zero() {
            tracing::debug!(connection = %self.id, "login delayed by {:?}", delay);
            tokio::time::sleep(delay).await;
        }
    }

    fn send_or_log(&self, telegram: Telegram) {
        if let Err(e) = self.channel.send(telegram) {
            tracing::debug!(connection = %self.id, "telegram not sent: {}", e);
        }
    }

    fn protocol_violation(self: &Arc<Self>, what: &str) {
        self.terminate(true, &DavError::IllegalState(what.to_string()).to_string());
    }

    fn host(&self) -> DavResult<Arc<dyn PeerHost>> {
        self.host
            .upgrade()
            .ok_or_else(|| DavError::ConnectionTerminated("distributor shut down".into()))
    }
}

fn login_result(answer: Telegram) -> DavResult<DistributorId> {
    match answer {
        Telegram::AuthenticationAnswer {
            success: true,
            distributor: Some(distributor),
        } => Ok(distributor),
        Telegram::AuthenticationAnswer { success: true, .. } => Err(DavError::InconsistentLogin(
            "remote distributor did not name itself".into(),
        )),
        Telegram::AuthenticationAnswer { .. } => {
            Err(DavError::InconsistentLogin("login rejected by remote distributor".into()))
        }
        other => Err(unexpected(&other)),
    }
}

fn unexpected(answer: &Telegram) -> DavError {
    DavError::IllegalState(format!("unexpected answer {:?}", answer.kind()))
}

impl TransmitterLink for PeerConnection {
    fn connection_id(&self) -> ConnectionId {
        self.id
    }

    fn remote_id(&self) -> DistributorId {
        self.state.lock().remote.unwrap_or_default()
    }

    fn weight(&self) -> u32 {
        self.state.lock().weight
    }

    fn user_id(&self) -> UserId {
        self.state.lock().user
    }

    fn send_telegram(&self, telegram: Telegram) -> DavResult<()> {
        if self.is_terminated() {
            return Err(DavError::ConnectionClosed);
        }
        self.channel.send(telegram)
    }
}

impl fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConnection")
            .field("id", &self.id)
            .field("direction", &self.direction)
            .field("remote", &self.remote())
            .field("state", &self.communication_state())
            .finish()
    }
}
