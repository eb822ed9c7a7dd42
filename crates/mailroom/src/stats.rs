//! Flow activity counters and recent contacts per segment.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use mailroom_core_backend::CoreTx;
use mailroom_flows::Segment;
use mailroom_kv_backend::KvBackend;
use mailroom_models::{ContactID, ExitUUID, FlowActivityCount, FlowID, FlowUUID, NodeUUID, RECENT_CONTACT_UI_TYPES};
use tracing::warn;

use crate::assets::OrgAssets;
use crate::hooks::{HookResult, PreCommitHook, SceneBatch};
use crate::runtime::Runtime;

pub const RECENT_CONTACTS_CAP: usize = 5;
pub const RECENT_CONTACTS_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const OPERAND_MAX_CHARS: usize = 100;

/// Something about a sprint worth counting.
#[derive(Debug, Clone, PartialEq)]
pub enum FlowStat {
    Segments(Vec<Segment>),
    /// A run result moved from `previous` to `category`.
    Result {
        flow_uuid: FlowUUID,
        key: String,
        category: Option<String>,
        previous: Option<String>,
    },
}

pub fn segment_scope(exit_uuid: ExitUUID, dest_uuid: NodeUUID) -> String {
    format!("segment:{exit_uuid}:{dest_uuid}")
}

pub fn result_scope(key: &str, category: &str) -> String {
    format!("result/{key}/{category}")
}

pub fn recent_contacts_key(exit_uuid: ExitUUID, dest_uuid: NodeUUID) -> String {
    format!("recent_contacts:{exit_uuid}:{dest_uuid}")
}

/// Member stored in a recent contacts set. The random prefix keeps repeat
/// visits by the same contact distinct.
pub fn recent_contact_member(contact_id: ContactID, operand: Option<&str>) -> String {
    let tag = URL_SAFE_NO_PAD.encode(rand::random::<[u8; 6]>());
    let operand: String = operand.unwrap_or_default().chars().take(OPERAND_MAX_CHARS).collect();
    format!("{tag}|{contact_id}|{operand}")
}

#[derive(Default)]
struct Counts(BTreeMap<(FlowID, String), i32>);

impl Counts {
    fn add(&mut self, flow_id: FlowID, scope: String, by: i32) {
        *self.0.entry((flow_id, scope)).or_default() += by;
    }

    fn into_rows(self) -> Vec<FlowActivityCount> {
        self.0
            .into_iter()
            .filter(|(_, count)| *count != 0)
            .map(|((flow_id, scope), count)| FlowActivityCount {
                flow_id,
                scope,
                count,
            })
            .collect()
    }
}

struct RecentContact {
    key: String,
    member: String,
    at: DateTime<Utc>,
}

pub struct UpdateFlowStats;

#[async_trait::async_trait]
impl PreCommitHook for UpdateFlowStats {
    type Payload = FlowStat;

    const NAME: &'static str = "update_flow_stats";
    const ORDER: i32 = 10;

    async fn execute(
        &self,
        tx: &mut dyn CoreTx,
        rt: &Runtime,
        assets: &OrgAssets,
        scenes: &SceneBatch<'_, FlowStat>,
    ) -> HookResult<()> {
        let mut counts = Counts::default();
        let mut recent = Vec::new();
        let mut ui_types: HashMap<FlowUUID, HashMap<NodeUUID, String>> = HashMap::new();

        for (scene, stats) in scenes {
            for stat in stats.iter() {
                match stat {
                    FlowStat::Segments(segments) => {
                        for segment in segments {
                            let Some(flow) = assets.flow_by_uuid(segment.flow_uuid) else {
                                continue;
                            };
                            counts.add(
                                flow.id,
                                segment_scope(segment.exit_uuid, segment.destination_uuid),
                                1,
                            );

                            let types = ui_types
                                .entry(flow.uuid)
                                .or_insert_with(|| flow.node_ui_types());
                            let operand = types
                                .get(&segment.node_uuid)
                                .filter(|t| RECENT_CONTACT_UI_TYPES.contains(&t.as_str()))
                                .and(segment.operand.as_deref());
                            recent.push(RecentContact {
                                key: recent_contacts_key(segment.exit_uuid, segment.destination_uuid),
                                member: recent_contact_member(scene.contact_id(), operand),
                                at: segment.time,
                            });
                        }
                    }
                    FlowStat::Result {
                        flow_uuid,
                        key,
                        category,
                        previous,
                    } => {
                        let Some(flow) = assets.flow_by_uuid(*flow_uuid) else {
                            continue;
                        };
                        if let Some(category) = category {
                            counts.add(flow.id, result_scope(key, category), 1);
                        }
                        if let Some(previous) = previous {
                            counts.add(flow.id, result_scope(key, previous), -1);
                        }
                    }
                }
            }
        }

        let rows = counts.into_rows();
        if !rows.is_empty() {
            tx.insert_flow_activity(&rows).await?;
        }
        record_recent_contacts(rt.kv.as_ref(), &recent).await;
        Ok(())
    }
}

/// Recent contacts are advisory, so a KV failure is logged rather than
/// failing the commit.
async fn record_recent_contacts(kv: &dyn KvBackend, recent: &[RecentContact]) {
    for contact in recent {
        let score = contact.at.timestamp_nanos_opt().unwrap_or_default() as f64;
        if let Err(err) = kv
            .zset_add_capped(
                &contact.key,
                &contact.member,
                score,
                RECENT_CONTACTS_CAP,
                RECENT_CONTACTS_TTL,
            )
            .await
        {
            warn!(key = %contact.key, error = %err, "failed to record recent contact");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use mailroom_flows::{Event, EventKind};

    use super::*;
    use crate::test_support::{self, ANN, BOB, ORG};

    #[test]
    fn test_recent_contact_member_truncates_operand() {
        let long = "x".repeat(150);
        let member = recent_contact_member(ContactID(7), Some(&long));
        let parts: Vec<&str> = member.split('|').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[1], "7");
        assert_eq!(parts[2].len(), 100);

        let other = recent_contact_member(ContactID(7), Some(&long));
        assert_ne!(member, other);
        assert!(recent_contact_member(ContactID(7), None).ends_with("|7|"));
    }

    #[tokio::test]
    async fn test_segments_are_counted_across_scenes() {
        let fx = test_support::fixture().await;
        let assets = fx.rt.org_assets(ORG).await.unwrap();
        let mut scenes = vec![fx.scene(&assets, ANN), fx.scene(&assets, BOB)];
        for scene in &mut scenes {
            scene
                .start_session(
                    &fx.rt,
                    &assets,
                    fx.manual_trigger(&assets, test_support::FAVORITES),
                    false,
                )
                .await
                .unwrap();
        }
        let segment = scenes[0].sprint().unwrap().segments[0].clone();
        crate::commit::bulk_commit(&fx.rt, &assets, &mut scenes).await.unwrap();

        let scope = segment_scope(segment.exit_uuid, segment.destination_uuid);
        let store = fx.mem.snapshot();
        let total: i32 = store
            .flow_activity
            .iter()
            .filter(|c| c.scope == scope)
            .map(|c| c.count)
            .sum();
        assert_eq!(total, 2);

        let recent = fx
            .rt
            .kv
            .zset_members(&recent_contacts_key(segment.exit_uuid, segment.destination_uuid))
            .await
            .unwrap();
        assert_eq!(recent.len(), 2);
    }

    #[tokio::test]
    async fn test_result_change_moves_category_counts() {
        let fx = test_support::fixture().await;
        let assets = fx.rt.org_assets(ORG).await.unwrap();
        let flow = assets.flow_by_id(test_support::FAVORITES).unwrap();
        let mut scene = fx.scene(&assets, ANN);
        scene
            .start_session(&fx.rt, &assets, fx.manual_trigger(&assets, flow.id), false)
            .await
            .unwrap();
        scene
            .add_event(
                &assets,
                Event::new(EventKind::RunResultChanged {
                    name: "Favorite Color".to_string(),
                    value: "blue".to_string(),
                    category: Some("Blue".to_string()),
                    previous_category: Some("Red".to_string()),
                }),
                None,
            )
            .unwrap();
        scene.commit(&fx.rt, &assets).await.unwrap();

        let store = fx.mem.snapshot();
        let count = |scope: &str| -> i32 {
            store
                .flow_activity
                .iter()
                .filter(|c| c.flow_id == flow.id && c.scope == scope)
                .map(|c| c.count)
                .sum()
        };
        assert_eq!(count("result/favorite_color/Blue"), 1);
        assert_eq!(count("result/favorite_color/Red"), -1);
    }
}
