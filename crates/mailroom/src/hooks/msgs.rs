//! Message, label, log and broadcast hooks.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use mailroom_core_backend::{CoreTx, MsgDeletion, MsgHandled, MsgLabel};
use mailroom_kv_backend::{KvBackend, Priority};
use mailroom_models::{
    AirtimeTransfer, Broadcast, ChannelUUID, ContactID, ContactUUID, EventUUID, FlowUUID, HttpLog,
    LabelID, Msg, MsgUUID, OrgID, URN, URNID,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{HookResult, PostCommitHook, PreCommitHook, SceneBatch};
use crate::assets::OrgAssets;
use crate::queues;
use crate::runtime::Runtime;
use crate::tasks::{OrgTask, SendBroadcast};

/// KV list the external sender consumes for a channel.
pub fn outbox_key(channel_uuid: ChannelUUID) -> String {
    format!("msgs:{channel_uuid}")
}

/// A queued message together with the URN it goes to.
#[derive(Debug, Clone)]
pub struct OutgoingMsg {
    pub msg: Msg,
    pub urn: Option<URN>,
}

/// What the sender reads from the outbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxMsg {
    pub uuid: MsgUUID,
    pub org_id: OrgID,
    pub channel_uuid: ChannelUUID,
    pub contact_id: ContactID,
    pub contact_urn_id: Option<URNID>,
    pub urn: Option<String>,
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub quick_replies: Vec<String>,
    pub locale: Option<String>,
    pub high_priority: bool,
    pub queued_on: DateTime<Utc>,
}

/// Push queued messages onto their channels' outboxes. High priority
/// messages jump the line.
pub(crate) async fn push_outbox(
    kv: &dyn KvBackend,
    assets: &OrgAssets,
    msgs: &[OutgoingMsg],
) -> HookResult<usize> {
    let now = Utc::now();
    let mut pushed = 0;
    for outgoing in msgs {
        let msg = &outgoing.msg;
        let Some(channel) = msg.channel_id.and_then(|id| assets.channel_by_id(id)) else {
            warn!(msg_uuid = %msg.uuid, "queued message has no usable channel, not sending");
            continue;
        };
        let body = OutboxMsg {
            uuid: msg.uuid,
            org_id: msg.org_id,
            channel_uuid: channel.uuid,
            contact_id: msg.contact_id,
            contact_urn_id: msg.contact_urn_id,
            urn: outgoing.urn.as_ref().map(ToString::to_string),
            text: msg.text.clone(),
            attachments: msg.attachments.clone(),
            quick_replies: msg.quick_replies.clone(),
            locale: msg.locale.clone(),
            high_priority: msg.high_priority,
            queued_on: now,
        };
        kv.list_push(
            &outbox_key(channel.uuid),
            &serde_json::to_string(&body)?,
            msg.high_priority,
        )
        .await?;
        pushed += 1;
    }
    Ok(pushed)
}

pub struct InsertMessages;

#[async_trait::async_trait]
impl PreCommitHook for InsertMessages {
    type Payload = Msg;

    const NAME: &'static str = "insert_messages";
    const ORDER: i32 = 10;

    async fn execute(
        &self,
        tx: &mut dyn CoreTx,
        _rt: &Runtime,
        _assets: &OrgAssets,
        scenes: &SceneBatch<'_, Msg>,
    ) -> HookResult<()> {
        let msgs: Vec<Msg> = scenes
            .iter()
            .flat_map(|(_, msgs)| msgs.iter().cloned())
            .collect();
        tx.insert_msgs(&msgs).await?;
        Ok(())
    }
}

pub struct SendMessages;

#[async_trait::async_trait]
impl PostCommitHook for SendMessages {
    type Payload = OutgoingMsg;

    const NAME: &'static str = "send_messages";
    const ORDER: i32 = 10;

    async fn execute(
        &self,
        rt: &Runtime,
        assets: &OrgAssets,
        scenes: &SceneBatch<'_, OutgoingMsg>,
    ) -> HookResult<()> {
        let msgs: Vec<OutgoingMsg> = scenes
            .iter()
            .flat_map(|(_, msgs)| msgs.iter().cloned())
            .collect();
        let pushed = push_outbox(rt.kv.as_ref(), assets, &msgs).await?;
        debug!(count = pushed, "queued messages to outbox");
        Ok(())
    }
}

/// A broadcast created in a flow, with the contacts it named still to resolve.
#[derive(Debug, Clone)]
pub struct PendingBroadcast {
    pub broadcast: Broadcast,
    pub contact_uuids: Vec<ContactUUID>,
}

/// Persists broadcasts created in flows and queues their sending.
pub struct CreateBroadcasts;

#[async_trait::async_trait]
impl PostCommitHook for CreateBroadcasts {
    type Payload = PendingBroadcast;

    const NAME: &'static str = "create_broadcasts";
    const ORDER: i32 = 10;

    async fn execute(
        &self,
        rt: &Runtime,
        _assets: &OrgAssets,
        scenes: &SceneBatch<'_, PendingBroadcast>,
    ) -> HookResult<()> {
        for (_, pending) in scenes {
            for pending in pending.iter() {
                let mut broadcast = pending.broadcast.clone();
                if !pending.contact_uuids.is_empty() {
                    let ids = rt
                        .db
                        .load_contact_ids_by_uuids(broadcast.org_id, &pending.contact_uuids)
                        .await?;
                    broadcast.contact_ids.extend(ids);
                }

                let mut tx = rt.db.begin().await?;
                let broadcast_id = tx.insert_broadcast(&broadcast).await?;
                tx.commit().await?;

                queues::queue_org_task(
                    rt.kv.as_ref(),
                    queues::BATCH,
                    broadcast.org_id,
                    &OrgTask::SendBroadcast(SendBroadcast { broadcast_id }),
                    Priority::Default,
                )
                .await?;
            }
        }
        Ok(())
    }
}

/// A deprecated-context warning raised in a flow.
#[derive(Debug, Clone)]
pub struct FlowWarning {
    pub event_uuid: EventUUID,
    pub flow_uuid: FlowUUID,
}

pub fn flow_warnings_key(day: chrono::NaiveDate) -> String {
    format!("flow_warnings:{}", day.format("%Y-%m-%d"))
}

/// Counts warnings per flow per day. Each event is counted once, even when
/// the task that produced it is re-delivered.
pub struct IncrementWarnings;

#[async_trait::async_trait]
impl PostCommitHook for IncrementWarnings {
    type Payload = FlowWarning;

    const NAME: &'static str = "increment_warnings";
    const ORDER: i32 = 20;

    async fn execute(
        &self,
        rt: &Runtime,
        _assets: &OrgAssets,
        scenes: &SceneBatch<'_, FlowWarning>,
    ) -> HookResult<()> {
        let day_ttl = std::time::Duration::from_secs(60 * 60 * 24);
        let key = flow_warnings_key(Utc::now().date_naive());
        for (_, warnings) in scenes {
            for warning in warnings.iter() {
                let seen = format!("warning:{}", warning.event_uuid);
                if !rt.kv.set_nx(&seen, "1", day_ttl).await? {
                    continue;
                }
                rt.kv
                    .hash_incr(&key, &warning.flow_uuid.to_string(), 1, Some(day_ttl * 7))
                    .await?;
            }
        }
        Ok(())
    }
}

pub struct MarkMsgsHandled;

#[async_trait::async_trait]
impl PreCommitHook for MarkMsgsHandled {
    type Payload = MsgHandled;

    const NAME: &'static str = "mark_msgs_handled";
    const ORDER: i32 = 90;

    async fn execute(
        &self,
        tx: &mut dyn CoreTx,
        _rt: &Runtime,
        _assets: &OrgAssets,
        scenes: &SceneBatch<'_, MsgHandled>,
    ) -> HookResult<()> {
        let msgs: Vec<MsgHandled> = scenes
            .iter()
            .filter_map(|(_, handled)| handled.last().cloned())
            .collect();
        tx.mark_msgs_handled(&msgs).await?;
        Ok(())
    }
}

pub struct InsertHttpLogs;

#[async_trait::async_trait]
impl PreCommitHook for InsertHttpLogs {
    type Payload = HttpLog;

    const NAME: &'static str = "insert_http_logs";
    const ORDER: i32 = 10;

    async fn execute(
        &self,
        tx: &mut dyn CoreTx,
        _rt: &Runtime,
        _assets: &OrgAssets,
        scenes: &SceneBatch<'_, HttpLog>,
    ) -> HookResult<()> {
        let logs: Vec<HttpLog> = scenes
            .iter()
            .flat_map(|(_, logs)| logs.iter().cloned())
            .collect();
        tx.insert_http_logs(&logs).await?;
        Ok(())
    }
}

pub struct InsertAirtimeTransfers;

#[async_trait::async_trait]
impl PreCommitHook for InsertAirtimeTransfers {
    type Payload = (AirtimeTransfer, Vec<HttpLog>);

    const NAME: &'static str = "insert_airtime_transfers";
    const ORDER: i32 = 10;

    async fn execute(
        &self,
        tx: &mut dyn CoreTx,
        _rt: &Runtime,
        _assets: &OrgAssets,
        scenes: &SceneBatch<'_, Self::Payload>,
    ) -> HookResult<()> {
        let mut transfers = Vec::new();
        let mut logs = Vec::new();
        for (_, payloads) in scenes {
            for (transfer, transfer_logs) in payloads.iter() {
                transfers.push(transfer.clone());
                logs.extend(transfer_logs.iter().cloned());
            }
        }
        tx.insert_airtime_transfers(&transfers).await?;
        if !logs.is_empty() {
            tx.insert_http_logs(&logs).await?;
        }
        Ok(())
    }
}

pub struct AddMessageLabels;

#[async_trait::async_trait]
impl PreCommitHook for AddMessageLabels {
    type Payload = MsgLabel;

    const NAME: &'static str = "add_message_labels";
    const ORDER: i32 = 10;

    async fn execute(
        &self,
        tx: &mut dyn CoreTx,
        _rt: &Runtime,
        _assets: &OrgAssets,
        scenes: &SceneBatch<'_, MsgLabel>,
    ) -> HookResult<()> {
        // a label applied twice in one batch is written once
        let mut labels: BTreeMap<(MsgUUID, LabelID), MsgLabel> = BTreeMap::new();
        for (_, payloads) in scenes {
            for label in payloads.iter() {
                labels.insert((label.msg_uuid, label.label_id), label.clone());
            }
        }
        let labels: Vec<MsgLabel> = labels.into_values().collect();
        tx.add_msg_labels(&labels).await?;
        Ok(())
    }
}

pub struct DeleteMessages;

#[async_trait::async_trait]
impl PreCommitHook for DeleteMessages {
    type Payload = MsgDeletion;

    const NAME: &'static str = "delete_messages";
    const ORDER: i32 = 10;

    async fn execute(
        &self,
        tx: &mut dyn CoreTx,
        _rt: &Runtime,
        _assets: &OrgAssets,
        scenes: &SceneBatch<'_, MsgDeletion>,
    ) -> HookResult<()> {
        let deletions: Vec<MsgDeletion> = scenes
            .iter()
            .flat_map(|(_, deletions)| deletions.iter().cloned())
            .collect();
        tx.delete_msgs(&deletions).await?;
        Ok(())
    }
}
