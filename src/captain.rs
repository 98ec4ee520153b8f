//! The captain — picks and maintains the home hub and keeps the lane
//! topology in shape.
//!
//! The captain owns no sockets and no cryptography: dialing, authorisation
//! and the network environment come in as collaborator traits, so the
//! orchestration logic is testable end-to-end with in-process stubs.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::access::Authorizer;
use crate::crane::{Crane, CraneOpts, CraneTransport};
use crate::docks::CraneRegistry;
use crate::error::{FlowError, FlowErrorKind};
use crate::hub::Hub;
use crate::intel::{Entity, Policy};
use crate::metrics::{CRANES_RETIRED, LANES_ESTABLISHED};
use crate::navigator::{HubType, Map, MapError, OptimizationResult, Options};
use crate::netenv::{ExceptionGuard, NetEnv};
use crate::terminal::TerminalOpts;
use crate::unit::Scheduler;

/// How long the auth exchange may take after the terminal is up.
const AUTH_TIMEOUT: Duration = Duration::from_secs(3);

/// Own cranes unsuggested for this long are retired when a pass allows it.
const STOP_CRANE_AFTER_UNSUGGESTED_FOR: Duration = Duration::from_secs(6 * 3600);

const DEFAULT_HOME_CANDIDATES: usize = 10;

/// Orchestration failures.
#[derive(Debug, thiserror::Error)]
pub enum CaptainError {
    /// The home policy filtered out every candidate.
    #[error("all home hubs are excluded")]
    AllHomeHubsExcluded,
    #[error("failed to locate own device")]
    NoDeviceLocation,
    #[error("no home hub candidates available")]
    NoCandidates,
    #[error("failed to connect to a new home hub, tried {tried} candidates: {last}")]
    AllCandidatesFailed { tried: usize, last: String },
    #[error("failed to set home hub on map")]
    SetHomeFailed,
    #[error("bootstrap failed: {0}")]
    Bootstrap(String),
    #[error("dial failed: {0}")]
    Dial(#[source] std::io::Error),
    #[error(transparent)]
    Map(#[from] MapError),
    #[error(transparent)]
    Flow(#[from] FlowError),
}

impl CaptainError {
    /// Whether this failure means the fabric is shutting down and the
    /// caller must stop immediately instead of trying other candidates.
    pub fn is_stopping(&self) -> bool {
        matches!(self, Self::Flow(err) if err.is(FlowErrorKind::Stopping))
    }
}

/// Produces connected transports to hubs. The secure channel (sockets,
/// TLS, peer verification) is established behind this trait.
pub trait Dialer: Send + Sync {
    fn dial<'a>(&'a self, hub: &'a Hub) -> BoxFuture<'a, std::io::Result<Box<dyn CraneTransport>>>;
}

/// Seeds the map when it is empty. At most one bootstrap is attempted per
/// captain operation.
pub trait Bootstrapper: Send + Sync {
    fn bootstrap<'a>(&'a self, map: &'a Map) -> BoxFuture<'a, Result<(), String>>;
}

/// Everything the captain depends on.
pub struct CaptainDeps {
    pub map: Arc<Map>,
    pub registry: Arc<CraneRegistry>,
    pub scheduler: Scheduler,
    pub dialer: Arc<dyn Dialer>,
    pub authorizer: Arc<dyn Authorizer>,
    pub netenv: Arc<dyn NetEnv>,
    pub bootstrapper: Arc<dyn Bootstrapper>,
}

/// Captain behavior knobs. `from_env` honors `FAIRWAY_HOME_CANDIDATES`
/// and `FAIRWAY_HOME_POLICY` (a JSON policy), falling back to defaults.
#[derive(Debug, Clone)]
pub struct CaptainConfig {
    /// How many home-hub candidates to request from the navigator.
    pub home_candidates: usize,
    /// Policy a hub must pass to serve as our home.
    pub home_policy: Policy,
}

impl Default for CaptainConfig {
    fn default() -> Self {
        Self {
            home_candidates: DEFAULT_HOME_CANDIDATES,
            home_policy: Policy::default(),
        }
    }
}

impl CaptainConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(value) = std::env::var("FAIRWAY_HOME_CANDIDATES") {
            match value.parse::<usize>() {
                Ok(n) if n > 0 => cfg.home_candidates = n,
                _ => warn!(%value, "ignoring invalid FAIRWAY_HOME_CANDIDATES"),
            }
        }
        if let Ok(value) = std::env::var("FAIRWAY_HOME_POLICY") {
            match serde_json::from_str::<Policy>(&value) {
                Ok(policy) => cfg.home_policy = policy,
                Err(e) => warn!(error = %e, "ignoring unparsable FAIRWAY_HOME_POLICY"),
            }
        }
        cfg
    }
}

/// Stops the crane on drop unless disarmed — the connect path has several
/// early returns and the half-built crane must not survive any of them.
struct CraneGuard {
    crane: Arc<Crane>,
    armed: bool,
}

impl CraneGuard {
    fn new(crane: Arc<Crane>) -> Self {
        Self { crane, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for CraneGuard {
    fn drop(&mut self) {
        if self.armed {
            self.crane
                .stop(Some(FlowError::stopping().wrap("connect attempt abandoned")));
        }
    }
}

/// See the module docs.
pub struct Captain {
    map: Arc<Map>,
    registry: Arc<CraneRegistry>,
    scheduler: Scheduler,
    dialer: Arc<dyn Dialer>,
    authorizer: Arc<dyn Authorizer>,
    netenv: Arc<dyn NetEnv>,
    bootstrapper: Arc<dyn Bootstrapper>,
    cfg: CaptainConfig,
    cancel: CancellationToken,
}

impl Captain {
    pub fn new(deps: CaptainDeps, cfg: CaptainConfig) -> Self {
        Self {
            map: deps.map,
            registry: deps.registry,
            scheduler: deps.scheduler,
            dialer: deps.dialer,
            authorizer: deps.authorizer,
            netenv: deps.netenv,
            bootstrapper: deps.bootstrapper,
            cfg,
            cancel: CancellationToken::new(),
        }
    }

    /// Token that aborts every running captain operation when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn map(&self) -> &Arc<Map> {
        &self.map
    }

    pub fn registry(&self) -> &Arc<CraneRegistry> {
        &self.registry
    }

    /// Pick a home hub and connect to it.
    ///
    /// Asks the navigator for candidates near the device's locations,
    /// bootstrapping the map at most once when it is empty, and walks the
    /// candidates in order until one connect succeeds. A `Stopping` failure
    /// aborts the walk immediately; any other failure is logged and the
    /// next candidate is tried.
    pub async fn establish_home_hub(&self) -> Result<(), CaptainError> {
        let locations = self
            .netenv
            .internet_location()
            .ok_or(CaptainError::NoDeviceLocation)?;
        debug!(
            v4 = ?locations.best_v4().map(|l| (l.latitude, l.longitude)),
            v6 = ?locations.best_v6().map(|l| (l.latitude, l.longitude)),
            "captain: looking for a new home hub"
        );

        // Entry-policy probes are best effort: the device location is an
        // approximation to begin with.
        let my_entity = locations.best_ip().map(Entity::from_ip);

        let opts = Options {
            hub_policies: vec![self.cfg.home_policy.clone()],
            check_hub_entry_policy_with: my_entity,
            ..self.map.default_options()
        };

        // Bounded retry: one bootstrap attempt per call.
        let mut bootstrapped = false;
        let candidates = loop {
            match self.map.find_nearest_hubs(
                locations.best_v4(),
                locations.best_v6(),
                &opts,
                HubType::Home,
                self.cfg.home_candidates,
            ) {
                Ok(candidates) => break candidates,
                Err(MapError::EmptyMap) if !bootstrapped => {
                    bootstrapped = true;
                    info!("captain: map is empty, bootstrapping");
                    self.bootstrapper
                        .bootstrap(&self.map)
                        .await
                        .map_err(CaptainError::Bootstrap)?;
                }
                Err(err) => return Err(err.into()),
            }
        };

        if candidates.is_empty() && opts.hub_policies_are_set() {
            return Err(CaptainError::AllHomeHubsExcluded);
        }

        let mut tried = 0;
        let mut last_failure: Option<String> = None;
        for pin in &candidates {
            tried += 1;
            match self.connect_to_home_hub(&pin.hub).await {
                Ok(()) => {
                    info!(
                        hub = %pin.hub,
                        failed_tries = tried - 1,
                        "captain: established connection to new home hub"
                    );
                    return Ok(());
                }
                Err(err) if err.is_stopping() => return Err(err),
                Err(err) => {
                    debug!(hub = %pin.hub, error = %err, "captain: home hub candidate failed");
                    last_failure = Some(err.to_string());
                }
            }
        }

        match last_failure {
            Some(last) => Err(CaptainError::AllCandidatesFailed { tried, last }),
            None => Err(CaptainError::NoCandidates),
        }
    }

    /// Connect, authenticate and register one home-hub candidate. Every
    /// resource acquired along the way is released on failure: the firewall
    /// exception by its guard, the crane by the stop guard.
    async fn connect_to_home_hub(&self, dst: &Hub) -> Result<(), CaptainError> {
        let _exceptions = ExceptionGuard::set(&*self.netenv, dst.ipv4, dst.ipv6);

        let transport = self.dialer.dial(dst).await.map_err(CaptainError::Dial)?;
        let crane = Crane::new(
            dst.clone(),
            transport,
            self.scheduler.clone(),
            CraneOpts {
                mine: true,
                public: false,
            },
        );
        let guard = CraneGuard::new(Arc::clone(&crane));

        // First contact: pull the peer's hub gossip into the map.
        match crane.query_gossip().await {
            Ok(op) => {
                tokio::select! {
                    result = op.wait() => match result {
                        Ok(hubs) => {
                            self.map.absorb_announcements(&hubs);
                        }
                        Err(err) => {
                            warn!(hub = %dst, error = %err, "captain: initial gossip query failed");
                        }
                    },
                    _ = self.cancel.cancelled() => {}
                }
            }
            Err(err) => {
                warn!(hub = %dst, error = %err, "captain: failed to start initial gossip query");
            }
        }

        let terminal = crane
            .establish_new_terminal(TerminalOpts::default())
            .await
            .map_err(|e| CaptainError::Flow(e.wrap("failed to connect home terminal")))?;

        let auth = self
            .authorizer
            .authorize_to_terminal(&terminal)
            .map_err(|e| CaptainError::Flow(e.wrap("failed to authorize")))?;

        tokio::select! {
            ended = auth.ended => match ended {
                Ok(err) if err.is_ok() => {}
                Ok(err) => {
                    return Err(CaptainError::Flow(err.wrap("failed to authenticate")));
                }
                Err(_) => {
                    return Err(CaptainError::Flow(
                        FlowError::internal("auth operation vanished"),
                    ));
                }
            },
            _ = tokio::time::sleep(AUTH_TIMEOUT) => {
                return Err(CaptainError::Flow(
                    FlowError::timeout().wrap("timed out waiting for auth to complete"),
                ));
            }
            _ = self.cancel.cancelled() => {
                return Err(CaptainError::Flow(FlowError::stopping()));
            }
        }

        // A successful auth is the peer's acknowledgement of the terminal.
        terminal.acknowledge();

        if !self.map.set_home(&dst.id, Arc::clone(&terminal)) {
            return Err(CaptainError::SetHomeFailed);
        }
        self.registry.assign(dst.id.clone(), Arc::clone(&crane));

        guard.disarm();
        Ok(())
    }

    /// Run one optimisation pass and apply it. Bootstraps the map at most
    /// once when it is empty.
    pub async fn optimize_network(&self) -> Result<(), CaptainError> {
        let mut bootstrapped = false;
        let result = loop {
            match self.map.optimize(None) {
                Ok(result) => break result,
                Err(MapError::EmptyMap) if !bootstrapped => {
                    bootstrapped = true;
                    info!("captain: map is empty, bootstrapping before optimisation");
                    self.bootstrapper
                        .bootstrap(&self.map)
                        .await
                        .map_err(CaptainError::Bootstrap)?;
                }
                Err(err) => return Err(err.into()),
            }
        };
        self.apply_optimization(result).await
    }

    /// Apply a pass result: refresh suggested cranes (aborting pending
    /// retirement), establish new lanes up to `max_connect`, and — when the
    /// pass allows it — retire own cranes unsuggested for too long.
    pub async fn apply_optimization(&self, result: OptimizationResult) -> Result<(), CaptainError> {
        let mut created = 0usize;
        let mut attempted = 0usize;

        for suggestion in &result.suggested {
            if suggestion.duplicate {
                continue;
            }

            if let Some(crane) = self.registry.get(&suggestion.hub.id) {
                crane.net_state.update_last_suggested_at();
                if crane.abort_stopping() {
                    info!(
                        hub = %suggestion.hub,
                        "captain: optimisation aborted retiring of crane, removed stopping mark"
                    );
                }
            } else if created < result.max_connect {
                attempted += 1;
                match self.establish_public_lane(&suggestion.hub).await {
                    Ok(crane) => {
                        created += 1;
                        crane.net_state.update_last_suggested_at();
                        metrics::counter!(LANES_ESTABLISHED).increment(1);
                        info!(hub = %suggestion.hub, reason = suggestion.reason, "captain: established lane");
                    }
                    Err(err) if err.is_stopping() => return Err(err),
                    Err(err) => {
                        warn!(hub = %suggestion.hub, error = %err, "captain: failed to establish lane");
                    }
                }
            }
        }

        if attempted > 0 {
            info!(
                created,
                attempted,
                purpose = result.purpose,
                "captain: optimisation created new connections"
            );
        } else {
            info!(
                checked = result.suggested.len(),
                purpose = result.purpose,
                "captain: optimisation checked connections"
            );
        }

        if result.stop_others {
            for crane in self.registry.all() {
                if !crane.is_mine() || crane.is_stopped() || crane.is_stopping() {
                    continue;
                }
                if crane.net_state.last_suggested_at().elapsed() < STOP_CRANE_AFTER_UNSUGGESTED_FOR
                {
                    continue;
                }
                if crane.mark_stopping() {
                    metrics::counter!(CRANES_RETIRED).increment(1);
                    info!(hub = %crane.connected_hub(), "captain: retiring crane, marked as stopping");
                }
            }
        }

        Ok(())
    }

    /// Open a public lane to `hub` for optimisation traffic.
    async fn establish_public_lane(&self, hub: &Hub) -> Result<Arc<Crane>, CaptainError> {
        if self.cancel.is_cancelled() {
            return Err(CaptainError::Flow(FlowError::stopping()));
        }
        let transport = self.dialer.dial(hub).await.map_err(CaptainError::Dial)?;
        let crane = Crane::new(
            hub.clone(),
            transport,
            self.scheduler.clone(),
            CraneOpts {
                mine: true,
                public: true,
            },
        );
        self.registry.assign(hub.id.clone(), Arc::clone(&crane));
        Ok(crane)
    }

    /// Spawn the periodic re-optimisation task. Runs until the captain's
    /// cancellation token fires; per-pass failures are logged, never fatal.
    pub fn spawn_periodic_optimization(
        self: Arc<Self>,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
                if let Err(err) = self.optimize_network().await {
                    if err.is_stopping() {
                        return;
                    }
                    warn!(error = %err, "captain: optimisation pass failed");
                }
            }
        })
    }
}
