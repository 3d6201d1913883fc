pub mod auth;
pub mod grpc_io;

use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tonic::{Request, Response, Status, Streaming};

use fleetmon_common::proto::fleet_service_server::FleetService;
use fleetmon_common::proto::{self, Receipt, Uint64Receipt};
use fleetmon_common::types::{task_type, GeoIp, Host, HostState, Ip};
use fleetmon_common::util::ip_desensitize;

use crate::io_stream::STREAM_MAGIC;
use crate::model::Service;
use crate::sentinel::ReportData;
use crate::state::AppState;

const CONFIG_FETCH_TIMEOUT: Duration = Duration::from_secs(10);
const IO_STREAM_KEEPALIVE: Duration = Duration::from_secs(30);
const TASK_STREAM_KEEPALIVE: Duration = Duration::from_secs(20);

type BoxStream<T> = Pin<Box<dyn Stream<Item = Result<T, Status>> + Send>>;

/// The agent-facing gRPC surface.
pub struct FleetRpc {
    state: AppState,
}

impl FleetRpc {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }
}

#[tonic::async_trait]
impl FleetService for FleetRpc {
    type RequestTaskStream = BoxStream<proto::Task>;
    type ReportSystemStateStream = BoxStream<proto::Receipt>;
    type IoStreamStream = BoxStream<proto::IoStreamData>;

    async fn request_task(
        &self,
        request: Request<Streaming<proto::TaskResult>>,
    ) -> Result<Response<Self::RequestTaskStream>, Status> {
        let (ip, secret, uuid) = auth::extract(&self.state, &request);
        let client_id = auth::check(&self.state, ip, secret, uuid).await?;
        let mut inbound = request.into_inner();

        let agent = self
            .state
            .registry
            .get(client_id)
            .ok_or_else(|| Status::unauthenticated("client auth failed"))?;

        let (tx, rx) = mpsc::unbounded_channel();
        agent.set_task_stream(tx);

        let state = self.state.clone();
        tokio::spawn(async move {
            loop {
                match inbound.message().await {
                    Ok(Some(result)) => handle_task_result(&state, client_id, result).await,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!(client_id, error = %e, "task stream closed");
                        break;
                    }
                }
            }
        });

        let outbound = UnboundedReceiverStream::new(rx).map(Ok);
        Ok(Response::new(Box::pin(outbound)))
    }

    async fn report_system_state(
        &self,
        request: Request<Streaming<proto::State>>,
    ) -> Result<Response<Self::ReportSystemStateStream>, Status> {
        let (ip, secret, uuid) = auth::extract(&self.state, &request);
        let client_id = auth::check(&self.state, ip, secret, uuid).await?;
        let mut inbound = request.into_inner();

        let (tx, rx) = mpsc::unbounded_channel();
        let state = self.state.clone();
        tokio::spawn(async move {
            loop {
                match inbound.message().await {
                    Ok(Some(frame)) => {
                        let Some(agent) = state.registry.get(client_id) else {
                            break;
                        };
                        agent.record_state(HostState::from(frame), Utc::now());
                        if tx.send(Ok(Receipt { proced: true })).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!(client_id, error = %e, "state stream closed");
                        break;
                    }
                }
            }
        });

        Ok(Response::new(Box::pin(UnboundedReceiverStream::new(rx))))
    }

    async fn report_system_info(
        &self,
        request: Request<proto::Host>,
    ) -> Result<Response<Uint64Receipt>, Status> {
        let (ip, secret, uuid) = auth::extract(&self.state, &request);
        let client_id = auth::check(&self.state, ip, secret, uuid).await?;
        let host = Host::from(request.into_inner());

        let Some(agent) = self.state.registry.get(client_id) else {
            return Err(Status::not_found("server not found"));
        };

        // a boot-time jump flushes the pre-reboot traffic immediately so the
        // hourly accounting never mixes two uptimes
        if let Some((tx_in, tx_out)) = agent.record_host(host) {
            if tx_in > 0 || tx_out > 0 {
                let recorded_at =
                    crate::housekeeping::hour_start(self.state.scheduler.timezone());
                let row = fleetmon_storage::store::transfer::NewTransfer {
                    server_id: client_id,
                    transfer_in: tx_in,
                    transfer_out: tx_out,
                    recorded_at,
                };
                if let Err(e) = self.state.store.insert_transfers(vec![row]).await {
                    tracing::error!(error = %e, "failed to flush reboot transfer");
                }
            }
        }

        Ok(Response::new(Uint64Receipt {
            data: self.state.boot_time,
        }))
    }

    async fn report_geo_ip(
        &self,
        request: Request<proto::GeoIp>,
    ) -> Result<Response<proto::GeoIp>, Status> {
        let (ip, secret, uuid) = auth::extract(&self.state, &request);
        let client_id = auth::check(&self.state, ip, secret, uuid).await?;
        let peer_ip = auth::real_ip(&self.state, &request);
        let frame = request.into_inner();
        let use6 = frame.use6;
        let mut geoip = GeoIp::from(frame);

        // agents behind NAT may not know their public address at all
        if geoip.ip.ipv4_addr.is_empty() && geoip.ip.ipv6_addr.is_empty() {
            geoip.ip.ipv4_addr = peer_ip;
        }
        let joined = geoip.ip.join();

        let Some(agent) = self.state.registry.get(client_id) else {
            return Err(Status::not_found("server not found"));
        };
        let previous = agent.geoip();
        let meta = agent.meta();
        let changed = previous.ip != geoip.ip;

        if meta.enable_ddns && !joined.is_empty() && changed {
            match self.state.ddns.updaters_for(&meta.ddns_profiles, &geoip.ip) {
                Ok(updaters) => {
                    for updater in updaters {
                        let ddns = self.state.ddns.clone();
                        let overrides = meta
                            .override_ddns_domains
                            .get(&updater.profile_id())
                            .cloned()
                            .unwrap_or_default();
                        tokio::spawn(async move {
                            ddns.run_update(&updater, &overrides).await;
                        });
                    }
                }
                Err(e) => {
                    tracing::warn!(server_id = client_id, error = %e, "ddns profiles unavailable");
                }
            }
        }

        let notify_change = changed
            && !previous.ip.join().is_empty()
            && !joined.is_empty()
            && self
                .state
                .with_config(|c| c.should_notify_ip_change(client_id));
        if notify_change {
            let (group_id, plain) = self.state.with_config(|c| {
                (
                    c.ip_change_notification_group_id,
                    c.enable_plain_ip_in_notification,
                )
            });
            let display = |ip: &Ip| {
                let joined = ip.join();
                if plain {
                    joined
                } else {
                    ip_desensitize(&joined)
                }
            };
            let message = format!(
                "[IP Changed] {}, {} => {}",
                meta.name,
                display(&previous.ip),
                display(&geoip.ip)
            );
            let label = fleetmon_notify::mute_label::ip_changed(client_id);
            let hub = self.state.hub.clone();
            tokio::spawn(async move {
                hub.send_notification(group_id, &message, Some(&label), None).await;
            });
        }

        // resolve the country code from whichever address the agent prefers
        let lookup_ip = if !geoip.ip.ipv6_addr.is_empty() && (use6 || geoip.ip.ipv4_addr.is_empty())
        {
            geoip.ip.ipv6_addr.clone()
        } else {
            geoip.ip.ipv4_addr.clone()
        };
        if let Ok(addr) = lookup_ip.parse::<IpAddr>() {
            if let Some(code) = self.state.geoip.lookup(addr) {
                geoip.country_code = code;
            }
        }

        let country_code = geoip.country_code.clone();
        agent.set_geoip(geoip);

        Ok(Response::new(proto::GeoIp {
            use6: false,
            ip: None,
            country_code,
            dashboard_boot_time: self.state.boot_time,
        }))
    }

    async fn io_stream(
        &self,
        request: Request<Streaming<proto::IoStreamData>>,
    ) -> Result<Response<Self::IoStreamStream>, Status> {
        let (ip, secret, uuid) = auth::extract(&self.state, &request);
        auth::check(&self.state, ip, secret, uuid).await?;
        let mut inbound = request.into_inner();

        let first = inbound
            .message()
            .await?
            .ok_or_else(|| Status::invalid_argument("missing stream id"))?;
        if first.data.len() < STREAM_MAGIC.len() || first.data[..4] != STREAM_MAGIC {
            return Err(Status::invalid_argument("invalid stream id"));
        }
        let stream_id = String::from_utf8(first.data[4..].to_vec())
            .map_err(|_| Status::invalid_argument("invalid stream id"))?;

        if !self.state.broker.has_stream(&stream_id) {
            return Err(Status::not_found("io stream not found"));
        }

        let (tx, rx) = mpsc::unbounded_channel();

        // empty-frame keepalive until the agent side goes away
        let keepalive_tx = tx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(IO_STREAM_KEEPALIVE);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if keepalive_tx
                    .send(Ok(proto::IoStreamData { data: Vec::new() }))
                    .is_err()
                {
                    break;
                }
            }
        });

        let io = grpc_io::GrpcIo::new(inbound, tx);
        self.state
            .broker
            .agent_connected(&stream_id, Box::new(io))
            .map_err(|e| Status::failed_precondition(e.to_string()))?;

        Ok(Response::new(Box::pin(UnboundedReceiverStream::new(rx))))
    }
}

/// Routes one inbound task result: command outcomes update the cron table
/// and notify, config replies resolve the single-slot cache, probe results
/// flow into the sentinel.
async fn handle_task_result(state: &AppState, client_id: u64, result: proto::TaskResult) {
    match result.r#type {
        task_type::COMMAND => {
            let Some(task) = state.crontask.get(result.id) else {
                return;
            };
            let Some(agent) = state.registry.get(client_id) else {
                return;
            };
            let server_name = agent.meta().name;
            let context = agent.notification_context();

            if task.push_successful && result.successful {
                let message = format!(
                    "[Scheduled Task Executed Successfully] {}, {}\n{}",
                    task.name, server_name, result.data
                );
                let hub = state.hub.clone();
                let group_id = task.notification_group_id;
                let ctx = context.clone();
                tokio::spawn(async move {
                    hub.send_notification(group_id, &message, None, Some(&ctx)).await;
                });
            }
            if !result.successful {
                let message = format!(
                    "[Scheduled Task Executed Failed] {}, {}\n{}",
                    task.name, server_name, result.data
                );
                let hub = state.hub.clone();
                let group_id = task.notification_group_id;
                tokio::spawn(async move {
                    hub.send_notification(group_id, &message, None, Some(&context)).await;
                });
            }

            let executed_at = Utc::now() - chrono::Duration::seconds(result.delay as i64);
            if let Err(e) = state
                .store
                .update_cron_execution(task.id, executed_at, result.successful)
                .await
            {
                tracing::error!(error = %e, task_id = task.id, "failed to record task result");
            }
        }
        task_type::REPORT_CONFIG => {
            if let Some(agent) = state.registry.get(client_id) {
                let reply = if result.successful {
                    Ok(result.data)
                } else {
                    Err(result.data)
                };
                agent.offer_config_reply(reply);
            }
        }
        t if task_type::is_sentinel_task(t) => {
            state
                .sentinel
                .dispatch(ReportData {
                    result,
                    reporter: client_id,
                })
                .await;
        }
        _ => {}
    }
}

/// Requests the agent's local config file and waits for the reply.
pub async fn fetch_agent_config(state: &AppState, server_id: u64) -> crate::error::Result<String> {
    let agent = state
        .registry
        .get(server_id)
        .ok_or(crate::error::ServerError::NotFound {
            entity: "server",
            id: server_id,
        })?;
    if !agent.send_task(proto::Task {
        id: server_id,
        r#type: task_type::REPORT_CONFIG,
        data: String::new(),
    }) {
        return Err(crate::error::ServerError::AgentOffline(server_id));
    }

    match agent.await_config_reply(CONFIG_FETCH_TIMEOUT).await {
        Some(Ok(config)) => Ok(config),
        Some(Err(message)) => Err(crate::error::ServerError::Config(message)),
        None => Err(crate::error::ServerError::AgentOffline(server_id)),
    }
}

/// Drains the probe dispatch bus, fanning each descriptor out to every
/// eligible agent's task stream (coverage- and permission-checked).
pub async fn dispatch_probes(state: AppState, mut rx: mpsc::Receiver<Arc<Service>>) {
    while let Some(service) = rx.recv().await {
        let owner_is_admin = state.users.is_admin(service.user_id);
        state.registry.range(|agent| {
            if !service.runs_on(agent.id) {
                return true;
            }
            let server_owner = agent.meta().user_id;
            if service.user_id != server_owner && !owner_is_admin {
                return true;
            }
            if agent.has_task_stream() {
                agent.send_task(service.to_task());
            }
            true
        });
    }
}

/// Registers the 20-second keepalive over every live task stream.
pub fn register_keepalive(state: &AppState) {
    let registry = state.registry.clone();
    state.scheduler.add_every(
        TASK_STREAM_KEEPALIVE,
        crate::scheduler::job(move || {
            let registry = registry.clone();
            async move {
                for agent in registry.sorted_list() {
                    if agent.has_task_stream() {
                        agent.send_task(proto::Task {
                            id: 0,
                            r#type: task_type::KEEPALIVE,
                            data: String::new(),
                        });
                    }
                }
            }
        }),
    );
}

