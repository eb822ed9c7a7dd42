//! Webhook node health.
//!
//! Every webhook call made from a flow node is counted into five minute
//! buckets, split into healthy and unhealthy series. A node whose last four
//! buckets hold enough unhealthy calls raises the org's `webhooks:unhealthy`
//! incident, and the node is recorded in the incident's member set. The
//! incident is ended by [`end_healthy_incidents`] once none of its nodes has
//! seen an unhealthy call for a whole window.
//!
//! Calls are counted only after the scene commit lands, so a rolled back or
//! retried commit never counts its calls twice.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use mailroom_core_backend::{CoreTx, ResthookUnsubscribe};
use mailroom_kv_backend::KvBackend;
use mailroom_models::{
    FlowUUID, INCIDENT_WEBHOOKS_UNHEALTHY, NOTIFICATION_INCIDENT_STARTED, NodeUUID, Notification,
};
use tracing::{debug, info};

use crate::assets::OrgAssets;
use crate::hooks::{HookResult, PostCommitHook, PreCommitHook, SceneBatch};
use crate::runtime::Runtime;

/// Elapsed time above which a call is unhealthy, unless the node configures its own.
pub const DEFAULT_HEALTHY_THRESHOLD: Duration = Duration::from_secs(10);

pub const BUCKET_SECONDS: i64 = 5 * 60;
pub const WINDOW_BUCKETS: i64 = 4;

/// Minimum unhealthy calls in a window before a node can be unhealthy.
pub const UNHEALTHY_MIN_CALLS: i64 = 10;
/// Share of unhealthy calls in a window above which a node is unhealthy.
pub const UNHEALTHY_RATIO: f64 = 0.25;

const COUNTER_TTL: Duration = Duration::from_secs((BUCKET_SECONDS * (WINDOW_BUCKETS + 1)) as u64);

/// One webhook call made from a flow node.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookCall {
    pub flow_uuid: FlowUUID,
    pub node_uuid: NodeUUID,
    pub healthy: bool,
    pub at: DateTime<Utc>,
}

pub fn counter_key(node: NodeUUID, healthy: bool, bucket: i64) -> String {
    let series = if healthy { "healthy" } else { "unhealthy" };
    format!("webhooks:{series}:{node}:{bucket}")
}

fn bucket_of(at: DateTime<Utc>) -> i64 {
    at.timestamp().div_euclid(BUCKET_SECONDS)
}

/// Healthy and unhealthy call counts of a node across the window ending at `at`.
pub async fn window_counts(
    kv: &dyn KvBackend,
    node: NodeUUID,
    at: DateTime<Utc>,
) -> HookResult<(i64, i64)> {
    let current = bucket_of(at);
    let mut healthy = 0;
    let mut unhealthy = 0;
    for bucket in (current - WINDOW_BUCKETS + 1)..=current {
        healthy += read_count(kv, &counter_key(node, true, bucket)).await?;
        unhealthy += read_count(kv, &counter_key(node, false, bucket)).await?;
    }
    Ok((healthy, unhealthy))
}

async fn read_count(kv: &dyn KvBackend, key: &str) -> HookResult<i64> {
    Ok(kv
        .get(key)
        .await?
        .and_then(|v| v.parse().ok())
        .unwrap_or_default())
}

pub fn is_unhealthy(healthy: i64, unhealthy: i64) -> bool {
    let total = healthy + unhealthy;
    unhealthy >= UNHEALTHY_MIN_CALLS && (unhealthy as f64 / total as f64) > UNHEALTHY_RATIO
}

/// Counts webhook calls and raises the unhealthy incident.
pub struct MonitorWebhooks;

#[async_trait::async_trait]
impl PostCommitHook for MonitorWebhooks {
    type Payload = WebhookCall;

    const NAME: &'static str = "monitor_webhooks";
    const ORDER: i32 = 30;

    async fn execute(
        &self,
        rt: &Runtime,
        assets: &OrgAssets,
        scenes: &SceneBatch<'_, WebhookCall>,
    ) -> HookResult<()> {
        let mut counts: BTreeMap<(NodeUUID, bool, i64), i64> = BTreeMap::new();
        let mut latest: BTreeMap<NodeUUID, DateTime<Utc>> = BTreeMap::new();
        for (_, calls) in scenes {
            for call in calls.iter() {
                *counts
                    .entry((call.node_uuid, call.healthy, bucket_of(call.at)))
                    .or_default() += 1;
                let seen = latest.entry(call.node_uuid).or_insert(call.at);
                *seen = (*seen).max(call.at);
            }
        }

        for ((node, healthy, bucket), count) in counts {
            rt.kv
                .incr_by(&counter_key(node, healthy, bucket), count, Some(COUNTER_TTL))
                .await?;
        }

        let mut unhealthy_nodes = Vec::new();
        for (node, at) in latest {
            let (healthy, unhealthy) = window_counts(rt.kv.as_ref(), node, at).await?;
            if is_unhealthy(healthy, unhealthy) {
                debug!(%node, healthy, unhealthy, "webhook node unhealthy");
                unhealthy_nodes.push(node);
            }
        }
        if !unhealthy_nodes.is_empty() {
            raise_incident(rt, assets, &unhealthy_nodes).await?;
        }
        Ok(())
    }
}

/// Get or create the org's webhooks incident, notifying its users when it is
/// new, and add `nodes` to its member set.
async fn raise_incident(rt: &Runtime, assets: &OrgAssets, nodes: &[NodeUUID]) -> HookResult<()> {
    let now = Utc::now();
    let mut tx = rt.db.begin().await?;
    let (incident, created) = tx
        .get_or_create_incident(assets.org_id(), INCIDENT_WEBHOOKS_UNHEALTHY, "", now)
        .await?;
    if created {
        let notifications: Vec<Notification> = assets
            .users()
            .iter()
            .map(|user| Notification {
                org_id: assets.org_id(),
                notification_type: NOTIFICATION_INCIDENT_STARTED.to_string(),
                scope: incident.id.to_string(),
                user_id: user.id,
                ticket_id: None,
                incident_id: Some(incident.id),
                created_on: now,
            })
            .collect();
        if !notifications.is_empty() {
            tx.insert_notifications(&notifications).await?;
        }
    }
    tx.commit().await?;

    for node in nodes {
        rt.kv
            .set_add(&incident.nodes_key(), &node.to_string(), None)
            .await?;
    }
    if created {
        info!(org_id = %assets.org_id(), incident_id = %incident.id, "webhooks incident started");
    }
    Ok(())
}

/// Removes resthook subscribers whose endpoint answered 410 Gone.
pub struct UnsubscribeResthooks;

#[async_trait::async_trait]
impl PreCommitHook for UnsubscribeResthooks {
    type Payload = ResthookUnsubscribe;

    const NAME: &'static str = "unsubscribe_resthooks";
    const ORDER: i32 = 10;

    async fn execute(
        &self,
        tx: &mut dyn CoreTx,
        _rt: &Runtime,
        _assets: &OrgAssets,
        scenes: &SceneBatch<'_, ResthookUnsubscribe>,
    ) -> HookResult<()> {
        let mut unsubscribes: Vec<ResthookUnsubscribe> = Vec::new();
        for (_, payloads) in scenes {
            for unsubscribe in payloads.iter() {
                if !unsubscribes.contains(unsubscribe) {
                    unsubscribes.push(unsubscribe.clone());
                }
            }
        }
        tx.unsubscribe_resthooks(&unsubscribes).await?;
        Ok(())
    }
}

/// End open webhook incidents whose nodes have had no unhealthy calls for a
/// full window. Returns the number of incidents ended.
pub async fn end_healthy_incidents(rt: &Runtime) -> HookResult<usize> {
    let incidents = rt.db.load_open_incidents(INCIDENT_WEBHOOKS_UNHEALTHY).await?;
    if incidents.is_empty() {
        return Ok(0);
    }

    let now = Utc::now();
    let mut healed = Vec::new();
    'incidents: for incident in incidents {
        for node in rt.kv.set_members(&incident.nodes_key()).await? {
            let Ok(node) = node.parse::<NodeUUID>() else {
                continue;
            };
            let (_, unhealthy) = window_counts(rt.kv.as_ref(), node, now).await?;
            if unhealthy > 0 {
                continue 'incidents;
            }
        }
        healed.push(incident);
    }
    if healed.is_empty() {
        return Ok(0);
    }

    let mut tx = rt.db.begin().await?;
    for incident in &healed {
        tx.end_incident(incident.id, now).await?;
    }
    tx.commit().await?;
    for incident in &healed {
        rt.kv.del(&incident.nodes_key()).await?;
        info!(org_id = %incident.org_id, incident_id = %incident.id, "webhooks incident ended");
    }
    Ok(healed.len())
}
