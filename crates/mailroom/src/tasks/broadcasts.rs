//! Sending broadcasts: one outgoing message per recipient, in batches.

use std::time::Duration;

use chrono::Utc;
use mailroom_models::{
    Broadcast, BroadcastID, ChannelRole, Contact, ContactStatus, FAILED_REASON_CONTACT_STATUS,
    FAILED_REASON_NO_DESTINATION, Msg, MsgDirection, MsgID, MsgStatus, MsgType, MsgUUID,
    MsgVisibility, OrgID,
};
use tracing::{debug, info, warn};

use super::{TaskError, TaskResult};
use crate::assets::OrgAssets;
use crate::hooks::msgs::{OutgoingMsg, push_outbox};
use crate::recipients::{self, Recipients};
use crate::runtime::Runtime;

pub const SEND_BATCH_SIZE: usize = 100;

/// Batches already sent are remembered this long, so a redelivered task
/// doesn't message anyone twice.
const SENT_MARKER_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

fn sent_marker_key(broadcast_id: BroadcastID, batch: usize) -> String {
    format!("broadcast_sent:{broadcast_id}:{batch}")
}

pub async fn send_broadcast(
    rt: &Runtime,
    org_id: OrgID,
    broadcast_id: BroadcastID,
) -> TaskResult<()> {
    let assets = rt.org_assets(org_id).await?;
    let broadcast = rt
        .db
        .load_broadcast(org_id, broadcast_id)
        .await?
        .ok_or_else(|| TaskError::NotFound(format!("broadcast {broadcast_id}")))?;

    let contact_ids =
        recipients::resolve(rt, &assets, &Recipients::for_broadcast(&broadcast), None).await?;

    let mut sent = 0;
    for (i, batch) in contact_ids.chunks(SEND_BATCH_SIZE).enumerate() {
        let marker = sent_marker_key(broadcast_id, i);
        if rt.kv.get(&marker).await?.is_some() {
            debug!(%broadcast_id, batch = i, "broadcast batch already sent");
            continue;
        }

        let contacts = rt.db.load_contacts(org_id, batch).await?;
        let outgoing: Vec<OutgoingMsg> = contacts
            .iter()
            .filter_map(|c| broadcast_msg(&assets, &broadcast, c))
            .collect();
        if outgoing.is_empty() {
            continue;
        }

        let rows: Vec<Msg> = outgoing.iter().map(|o| o.msg.clone()).collect();
        let mut tx = rt.db.begin().await?;
        let ids = tx.insert_msgs(&rows).await?;
        tx.commit().await?;
        rt.kv.set(&marker, "1", Some(SENT_MARKER_TTL)).await?;

        let queued: Vec<OutgoingMsg> = outgoing
            .into_iter()
            .zip(ids)
            .filter(|(o, _)| o.msg.status == MsgStatus::Queued)
            .map(|(mut o, id)| {
                o.msg.id = id;
                o
            })
            .collect();
        sent += push_outbox(rt.kv.as_ref(), &assets, &queued).await?;
    }

    info!(%broadcast_id, recipients = contact_ids.len(), sent, "broadcast sent");
    Ok(())
}

/// The message a contact gets for a broadcast, failed up front when the
/// contact can't be messaged.
fn broadcast_msg(assets: &OrgAssets, broadcast: &Broadcast, contact: &Contact) -> Option<OutgoingMsg> {
    let Some(translation) = broadcast.translation_for(contact.language.as_deref()) else {
        warn!(broadcast_id = %broadcast.id, "broadcast has no translations");
        return None;
    };
    let destination = contact
        .urns
        .iter()
        .find_map(|urn| assets.channel_for_urn(urn, ChannelRole::Send).map(|ch| (urn, ch)));

    let (status, failed_reason) = if contact.status != ContactStatus::Active {
        (MsgStatus::Failed, Some(FAILED_REASON_CONTACT_STATUS))
    } else if destination.is_none() {
        (MsgStatus::Failed, Some(FAILED_REASON_NO_DESTINATION))
    } else {
        (MsgStatus::Queued, None)
    };

    let now = Utc::now();
    let locale = contact
        .language
        .clone()
        .filter(|lang| broadcast.translations.contains_key(lang))
        .or_else(|| Some(broadcast.base_language.clone()));
    let msg = Msg {
        id: MsgID(0),
        uuid: MsgUUID::new(),
        org_id: broadcast.org_id,
        channel_id: destination.map(|(_, ch)| ch.id),
        contact_id: contact.id,
        contact_urn_id: destination.map(|(urn, _)| urn.id),
        direction: MsgDirection::Out,
        status,
        visibility: MsgVisibility::Visible,
        msg_type: if broadcast.optin_id.is_some() {
            MsgType::Optin
        } else {
            MsgType::Text
        },
        text: translation.text.clone(),
        attachments: translation.attachments.clone(),
        quick_replies: translation.quick_replies.clone(),
        locale,
        flow_id: None,
        ticket_id: None,
        broadcast_id: Some(broadcast.id),
        optin_id: broadcast.optin_id,
        created_by_id: broadcast.created_by_id,
        external_id: None,
        high_priority: false,
        error_count: 0,
        failed_reason: failed_reason.map(str::to_string),
        created_on: now,
        modified_on: now,
        sent_on: None,
    };
    Some(OutgoingMsg {
        urn: destination.map(|(urn, _)| urn.urn.clone()),
        msg,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use mailroom_kv_backend::KvBackend;
    use mailroom_models::{BroadcastTranslation, BroadcastUUID, Exclusions};

    use super::*;
    use crate::hooks::msgs::{OutboxMsg, outbox_key};
    use crate::test_support::{self, ANN, BOB, CAT, ORG, TWILIO};

    fn seed_broadcast(fx: &test_support::Fixture, contact_ids: Vec<mailroom_models::ContactID>) -> BroadcastID {
        let id = BroadcastID(77);
        let mut translations = BTreeMap::new();
        translations.insert(
            "eng".to_string(),
            BroadcastTranslation {
                text: "Hi there".to_string(),
                ..Default::default()
            },
        );
        translations.insert(
            "fra".to_string(),
            BroadcastTranslation {
                text: "Bonjour".to_string(),
                ..Default::default()
            },
        );
        fx.mem.seed(|store| {
            store.broadcasts.insert(
                id,
                Broadcast {
                    id,
                    uuid: BroadcastUUID::new(),
                    org_id: ORG,
                    translations,
                    base_language: "eng".to_string(),
                    optin_id: None,
                    contact_ids,
                    group_ids: vec![],
                    urns: vec![],
                    query: None,
                    exclusions: Exclusions::default(),
                    created_by_id: None,
                    created_on: Utc::now(),
                },
            );
        });
        id
    }

    #[tokio::test]
    async fn test_broadcast_messages_each_contact() {
        let fx = test_support::fixture().await;
        fx.mem.seed(|store| {
            let bob = store.contacts.get_mut(&BOB).unwrap();
            bob.language = Some("fra".to_string());
            bob.status = ContactStatus::Stopped;
        });
        let id = seed_broadcast(&fx, vec![ANN, BOB]);

        send_broadcast(&fx.rt, ORG, id).await.unwrap();

        let msgs: Vec<Msg> = fx
            .mem
            .msgs()
            .into_iter()
            .filter(|m| m.broadcast_id == Some(id))
            .collect();
        assert_eq!(msgs.len(), 2);
        let ann = msgs.iter().find(|m| m.contact_id == ANN).unwrap();
        assert_eq!(ann.status, MsgStatus::Queued);
        assert_eq!(ann.text, "Hi there");
        let bob = msgs.iter().find(|m| m.contact_id == BOB).unwrap();
        assert_eq!(bob.status, MsgStatus::Failed);
        assert_eq!(bob.text, "Bonjour");
        assert_eq!(bob.failed_reason.as_deref(), Some(FAILED_REASON_CONTACT_STATUS));

        let assets = fx.rt.org_assets(ORG).await.unwrap();
        let channel = assets.channel_by_id(TWILIO).unwrap();
        let outbox = fx.rt.kv.list_range(&outbox_key(channel.uuid)).await.unwrap();
        assert_eq!(outbox.len(), 1);
        let queued: OutboxMsg = serde_json::from_str(&outbox[0]).unwrap();
        assert_eq!(queued.uuid, ann.uuid);
    }

    #[tokio::test]
    async fn test_redelivered_broadcast_is_not_resent() {
        let fx = test_support::fixture().await;
        let id = seed_broadcast(&fx, vec![ANN, CAT]);
        send_broadcast(&fx.rt, ORG, id).await.unwrap();
        send_broadcast(&fx.rt, ORG, id).await.unwrap();
        let count = fx
            .mem
            .msgs()
            .iter()
            .filter(|m| m.broadcast_id == Some(id))
            .count();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn test_failed_insert_leaves_batch_unsent() {
        let fx = test_support::fixture().await;
        let id = seed_broadcast(&fx, vec![ANN]);
        fx.mem.fail_op("insert_msgs");
        assert!(send_broadcast(&fx.rt, ORG, id).await.is_err());

        fx.mem.clear_failures();
        send_broadcast(&fx.rt, ORG, id).await.unwrap();
        assert_eq!(
            fx.mem
                .msgs()
                .iter()
                .filter(|m| m.broadcast_id == Some(id))
                .count(),
            1
        );
    }
}
