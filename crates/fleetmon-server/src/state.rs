use std::sync::{Arc, RwLock};

use chrono::Utc;
use tokio::sync::mpsc;

use fleetmon_notify::{Notification, NotificationHub, RequestMethod, RequestType};
use fleetmon_storage::Store;

use crate::alerts::AlertManager;
use crate::config::Config;
use crate::crontask::CronCoordinator;
use crate::ddns::DdnsManager;
use crate::error::Result;
use crate::geoip::GeoIpResolver;
use crate::io_stream::IoStreamBroker;
use crate::model::Service;
use crate::nat::NatRegistry;
use crate::online_user::OnlineUserTable;
use crate::registry::AgentRegistry;
use crate::scheduler::Scheduler;
use crate::sentinel::ServiceSentinel;
use crate::users::UserIndex;

/// The composition root: every long-lived component, built once at startup
/// in dependency order and passed by reference from there on.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RwLock<Config>>,
    pub store: Store,
    pub users: Arc<UserIndex>,
    pub registry: Arc<AgentRegistry>,
    pub hub: Arc<NotificationHub>,
    pub scheduler: Arc<Scheduler>,
    pub crontask: Arc<CronCoordinator>,
    pub sentinel: Arc<ServiceSentinel>,
    pub alerts: Arc<AlertManager>,
    pub nats: Arc<NatRegistry>,
    pub ddns: Arc<DdnsManager>,
    pub geoip: Arc<GeoIpResolver>,
    pub broker: Arc<IoStreamBroker>,
    pub online: Arc<OnlineUserTable>,
    /// Unix seconds; sent to agents so they can detect dashboard restarts.
    pub boot_time: u64,
}

impl AppState {
    /// Builds all components. The cron coordinator exists before the
    /// sentinel so probe registration can close over a live scheduler; the
    /// returned receiver is the probe dispatch bus, drained by the RPC
    /// fan-out.
    pub async fn build(
        config: Config,
        store: Store,
    ) -> Result<(Self, mpsc::Receiver<Arc<Service>>)> {
        let tz = config.timezone();
        let avg_ping_count = config.avg_ping_count;
        let plain_ip = config.enable_plain_ip_in_notification;
        let agent_secret = config.agent_secret_key.clone();
        let geoip_db_path = config.geoip_db_path.clone();

        let users = Arc::new(UserIndex::load(&store, &agent_secret).await?);
        let nats = Arc::new(NatRegistry::load(store.list_nats().await?));
        let ddns = Arc::new(DdnsManager::load(store.list_ddns_profiles().await?));

        let hub = Arc::new(NotificationHub::new(tz));
        load_notifications(&store, &hub).await?;

        let registry = Arc::new(AgentRegistry::load(&store.list_servers().await?));
        let scheduler = Arc::new(Scheduler::new(tz));
        let crontask = CronCoordinator::load(
            &store,
            scheduler.clone(),
            registry.clone(),
            hub.clone(),
        )
        .await?;

        let (dispatch_tx, dispatch_rx) = mpsc::channel(1);
        let sentinel = ServiceSentinel::new(
            store.clone(),
            registry.clone(),
            hub.clone(),
            crontask.clone(),
            scheduler.clone(),
            dispatch_tx,
            avg_ping_count,
        )
        .await?;

        let alerts = AlertManager::load(
            store.clone(),
            registry.clone(),
            hub.clone(),
            crontask.clone(),
            users.clone(),
            plain_ip,
        )
        .await?;

        let state = Self {
            config: Arc::new(RwLock::new(config)),
            store,
            users,
            registry,
            hub,
            scheduler,
            crontask,
            sentinel,
            alerts,
            nats,
            ddns,
            geoip: Arc::new(GeoIpResolver::open(&geoip_db_path)),
            broker: Arc::new(IoStreamBroker::new()),
            online: Arc::new(OnlineUserTable::new()),
            boot_time: Utc::now().timestamp().max(0) as u64,
        };
        Ok((state, dispatch_rx))
    }

    pub fn with_config<R>(&self, f: impl FnOnce(&Config) -> R) -> R {
        f(&self.config.read().unwrap())
    }

    /// Admin deletion of servers: cascades the persisted rows (group
    /// memberships, transfers) and drops every piece of live state.
    pub async fn delete_servers(&self, ids: &[u64]) -> Result<()> {
        self.store.delete_servers(ids).await?;
        self.registry.delete(ids);
        self.alerts.forget_servers(ids);
        Ok(())
    }
}

/// Loads endpoints and groups into the hub, skipping rows with unknown
/// method/type discriminators.
async fn load_notifications(store: &Store, hub: &NotificationHub) -> Result<()> {
    let mut notifications = Vec::new();
    for m in store.list_notifications().await? {
        let (method, kind) = match (
            RequestMethod::from_i32(m.request_method),
            RequestType::from_i32(m.request_type),
        ) {
            (Ok(method), Ok(kind)) => (method, kind),
            _ => {
                tracing::warn!(id = m.id, name = %m.name, "skipping malformed notification endpoint");
                continue;
            }
        };
        notifications.push(Notification {
            id: m.id as u64,
            name: m.name,
            url: m.url,
            request_method: method,
            request_type: kind,
            request_header: m.request_header,
            request_body: m.request_body,
            verify_tls: m.verify_tls,
        });
    }

    let groups = store
        .list_notification_groups()
        .await?
        .into_iter()
        .map(|g| (g.id as u64, g.name))
        .collect();
    let members = store.list_notification_group_members().await?;
    hub.load(notifications, groups, members);
    Ok(())
}
