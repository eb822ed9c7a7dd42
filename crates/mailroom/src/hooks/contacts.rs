//! Contact attribute hooks.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use mailroom_core_backend::{ContactFieldUpdate, ContactURNsUpdate, CoreTx, GroupMembership};
use mailroom_models::{ContactID, ContactStatus, FieldValue, GroupID, URN};
use tracing::warn;

use super::campaigns::{self, CampaignFireChange};
use super::{HookResult, PreCommitHook, SceneBatch};
use crate::assets::OrgAssets;
use crate::runtime::Runtime;

/// Last payload each scene attached, paired with its contact.
fn last_per_scene<P: Clone>(scenes: &SceneBatch<'_, P>) -> Vec<(ContactID, P)> {
    scenes
        .iter()
        .filter_map(|(scene, payloads)| payloads.last().map(|p| (scene.contact_id(), p.clone())))
        .collect()
}

pub struct UpdateContactName;

#[async_trait::async_trait]
impl PreCommitHook for UpdateContactName {
    type Payload = Option<String>;

    const NAME: &'static str = "update_contact_name";
    const ORDER: i32 = 1;

    async fn execute(
        &self,
        tx: &mut dyn CoreTx,
        _rt: &Runtime,
        _assets: &OrgAssets,
        scenes: &SceneBatch<'_, Self::Payload>,
    ) -> HookResult<()> {
        tx.update_contact_names(&last_per_scene(scenes)).await?;
        Ok(())
    }
}

pub struct UpdateContactLanguage;

#[async_trait::async_trait]
impl PreCommitHook for UpdateContactLanguage {
    type Payload = Option<String>;

    const NAME: &'static str = "update_contact_language";
    const ORDER: i32 = 1;

    async fn execute(
        &self,
        tx: &mut dyn CoreTx,
        _rt: &Runtime,
        _assets: &OrgAssets,
        scenes: &SceneBatch<'_, Self::Payload>,
    ) -> HookResult<()> {
        tx.update_contact_languages(&last_per_scene(scenes)).await?;
        Ok(())
    }
}

pub struct UpdateContactStatus;

#[async_trait::async_trait]
impl PreCommitHook for UpdateContactStatus {
    type Payload = ContactStatus;

    const NAME: &'static str = "update_contact_status";
    const ORDER: i32 = 1;

    async fn execute(
        &self,
        tx: &mut dyn CoreTx,
        _rt: &Runtime,
        _assets: &OrgAssets,
        scenes: &SceneBatch<'_, Self::Payload>,
    ) -> HookResult<()> {
        tx.update_contact_statuses(&last_per_scene(scenes)).await?;
        Ok(())
    }
}

pub struct UpdateContactLastSeenOn;

#[async_trait::async_trait]
impl PreCommitHook for UpdateContactLastSeenOn {
    type Payload = DateTime<Utc>;

    const NAME: &'static str = "update_contact_last_seen_on";
    const ORDER: i32 = 1;

    async fn execute(
        &self,
        tx: &mut dyn CoreTx,
        _rt: &Runtime,
        _assets: &OrgAssets,
        scenes: &SceneBatch<'_, Self::Payload>,
    ) -> HookResult<()> {
        tx.update_contact_last_seen(&last_per_scene(scenes)).await?;
        Ok(())
    }
}

/// Field values keyed by field key. A `None` value clears the field.
pub struct UpdateContactFields;

#[async_trait::async_trait]
impl PreCommitHook for UpdateContactFields {
    type Payload = (String, Option<FieldValue>);

    const NAME: &'static str = "update_contact_fields";
    const ORDER: i32 = 1;

    async fn execute(
        &self,
        tx: &mut dyn CoreTx,
        _rt: &Runtime,
        _assets: &OrgAssets,
        scenes: &SceneBatch<'_, Self::Payload>,
    ) -> HookResult<()> {
        let mut updates = Vec::new();
        for (scene, payloads) in scenes {
            let mut latest: BTreeMap<&str, &Option<FieldValue>> = BTreeMap::new();
            for (key, value) in payloads.iter() {
                latest.insert(key, value);
            }
            updates.extend(latest.into_iter().map(|(key, value)| ContactFieldUpdate {
                contact_id: scene.contact_id(),
                key: key.to_string(),
                value: value.clone(),
            }));
        }
        tx.update_contact_fields(&updates).await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupChange {
    Add(GroupID),
    Remove(GroupID),
}

pub struct UpdateContactGroups;

#[async_trait::async_trait]
impl PreCommitHook for UpdateContactGroups {
    type Payload = GroupChange;

    const NAME: &'static str = "update_contact_groups";
    const ORDER: i32 = 1;

    async fn execute(
        &self,
        tx: &mut dyn CoreTx,
        _rt: &Runtime,
        _assets: &OrgAssets,
        scenes: &SceneBatch<'_, Self::Payload>,
    ) -> HookResult<()> {
        let mut adds = Vec::new();
        let mut removes = Vec::new();
        for (scene, payloads) in scenes {
            // later changes to the same group win
            let mut net: BTreeMap<GroupID, bool> = BTreeMap::new();
            for change in payloads.iter() {
                match change {
                    GroupChange::Add(id) => net.insert(*id, true),
                    GroupChange::Remove(id) => net.insert(*id, false),
                };
            }
            for (group_id, added) in net {
                let membership = GroupMembership {
                    contact_id: scene.contact_id(),
                    group_id,
                };
                if added {
                    adds.push(membership);
                } else {
                    removes.push(membership);
                }
            }
        }
        if !removes.is_empty() {
            tx.remove_contact_groups(&removes).await?;
        }
        if !adds.is_empty() {
            tx.add_contact_groups(&adds).await?;
        }
        Ok(())
    }
}

pub struct UpdateContactURNs;

#[async_trait::async_trait]
impl PreCommitHook for UpdateContactURNs {
    type Payload = Vec<URN>;

    const NAME: &'static str = "update_contact_urns";
    const ORDER: i32 = 1;

    async fn execute(
        &self,
        tx: &mut dyn CoreTx,
        _rt: &Runtime,
        _assets: &OrgAssets,
        scenes: &SceneBatch<'_, Self::Payload>,
    ) -> HookResult<()> {
        let updates: Vec<ContactURNsUpdate> = scenes
            .iter()
            .filter_map(|(scene, payloads)| {
                payloads.last().map(|urns| ContactURNsUpdate {
                    org_id: scene.org_id(),
                    contact_id: scene.contact_id(),
                    urns: urns.clone(),
                })
            })
            .collect();
        tx.update_contact_urns(&updates).await?;
        Ok(())
    }
}

/// Re-evaluates smart group membership against each contact's final state,
/// and reschedules campaign fires of the groups whose membership changed.
pub struct RecalculateSmartGroups;

#[async_trait::async_trait]
impl PreCommitHook for RecalculateSmartGroups {
    type Payload = ();

    const NAME: &'static str = "recalculate_smart_groups";
    const ORDER: i32 = 2;

    async fn execute(
        &self,
        tx: &mut dyn CoreTx,
        rt: &Runtime,
        assets: &OrgAssets,
        scenes: &SceneBatch<'_, ()>,
    ) -> HookResult<()> {
        let mut adds = Vec::new();
        let mut removes = Vec::new();
        let mut fire_changes = Vec::new();

        for (scene, _) in scenes {
            // only active contacts belong to smart groups
            let active = scene.contact().status == ContactStatus::Active;
            let mut changes = Vec::new();
            for group in assets.smart_groups() {
                let Some(query) = group.query.as_deref() else {
                    continue;
                };
                let evaluated = if active {
                    rt.engine.contact_matches_query(scene.contact(), query)
                } else {
                    Ok(false)
                };
                let matches = match evaluated {
                    Ok(matches) => matches,
                    Err(err) => {
                        warn!(group_id = %group.id, error = %err, "unable to evaluate smart group query");
                        continue;
                    }
                };
                let membership = GroupMembership {
                    contact_id: scene.contact_id(),
                    group_id: group.id,
                };
                match (matches, scene.db_contact().in_group(group.id)) {
                    (true, false) => {
                        adds.push(membership);
                        changes.push(CampaignFireChange::GroupAdded(group.id));
                    }
                    (false, true) => {
                        removes.push(membership);
                        changes.push(CampaignFireChange::GroupRemoved(group.id));
                    }
                    _ => {}
                }
            }
            if !changes.is_empty() {
                fire_changes.push((*scene, changes));
            }
        }

        if !removes.is_empty() {
            tx.remove_contact_groups(&removes).await?;
        }
        if !adds.is_empty() {
            tx.add_contact_groups(&adds).await?;
        }
        for (scene, changes) in fire_changes {
            campaigns::reschedule(tx, assets, scene, &changes).await?;
        }
        Ok(())
    }
}

pub struct UpdateContactModifiedOn;

#[async_trait::async_trait]
impl PreCommitHook for UpdateContactModifiedOn {
    type Payload = ();

    const NAME: &'static str = "update_contact_modified_on";
    const ORDER: i32 = 10;

    async fn execute(
        &self,
        tx: &mut dyn CoreTx,
        _rt: &Runtime,
        _assets: &OrgAssets,
        scenes: &SceneBatch<'_, ()>,
    ) -> HookResult<()> {
        let ids: Vec<ContactID> = scenes.iter().map(|(s, _)| s.contact_id()).collect();
        tx.update_contacts_modified_on(&ids, Utc::now()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use mailroom_flows::{FieldRef, GroupModification, Modifier};
    use mailroom_models::ContactStatus;

    use crate::scene::Via;
    use crate::test_support::{self, ANN, BOB, DOCTORS, ORG, TWENTIES};

    #[tokio::test]
    async fn test_modifiers_persist_contact_changes() {
        let fx = test_support::fixture().await;
        let assets = fx.rt.org_assets(ORG).await.unwrap();
        let before = fx.mem.contact(BOB).unwrap();

        let mut scene = fx.scene(&assets, BOB);
        let doctors = assets.group_ref(DOCTORS).unwrap();
        for modifier in [
            Modifier::Name {
                name: Some("Robert".to_string()),
            },
            Modifier::Language {
                language: Some("spa".to_string()),
            },
            Modifier::Groups {
                groups: vec![doctors],
                modification: GroupModification::Add,
            },
        ] {
            scene
                .apply_modifier(&fx.rt, &assets, &modifier, None, Via::Api)
                .unwrap();
        }
        scene.commit(&fx.rt, &assets).await.unwrap();

        let after = fx.mem.contact(BOB).unwrap();
        assert_eq!(after.name.as_deref(), Some("Robert"));
        assert_eq!(after.language.as_deref(), Some("spa"));
        assert!(after.in_group(DOCTORS));
        assert!(after.modified_on > before.modified_on);
    }

    #[tokio::test]
    async fn test_field_change_recalculates_smart_groups() {
        let fx = test_support::fixture().await;
        let assets = fx.rt.org_assets(ORG).await.unwrap();
        assert!(!fx.mem.contact(ANN).unwrap().in_group(TWENTIES));

        let mut scene = fx.scene(&assets, ANN);
        scene
            .apply_modifier(
                &fx.rt,
                &assets,
                &Modifier::Field {
                    field: FieldRef {
                        key: "age".to_string(),
                        name: "Age".to_string(),
                    },
                    value: Some("25".to_string()),
                },
                None,
                Via::Ui,
            )
            .unwrap();
        scene.commit(&fx.rt, &assets).await.unwrap();
        assert!(fx.mem.contact(ANN).unwrap().in_group(TWENTIES));

        let mut scene = fx.scene(&assets, ANN);
        scene
            .apply_modifier(
                &fx.rt,
                &assets,
                &Modifier::Field {
                    field: FieldRef {
                        key: "age".to_string(),
                        name: "Age".to_string(),
                    },
                    value: Some("41".to_string()),
                },
                None,
                Via::Ui,
            )
            .unwrap();
        scene.commit(&fx.rt, &assets).await.unwrap();
        assert!(!fx.mem.contact(ANN).unwrap().in_group(TWENTIES));
    }

    #[tokio::test]
    async fn test_blocking_removes_groups() {
        let fx = test_support::fixture().await;
        let assets = fx.rt.org_assets(ORG).await.unwrap();
        assert!(fx.mem.contact(ANN).unwrap().in_group(DOCTORS));

        let mut scene = fx.scene(&assets, ANN);
        scene
            .apply_modifier(
                &fx.rt,
                &assets,
                &Modifier::Status {
                    status: ContactStatus::Blocked,
                },
                None,
                Via::Ui,
            )
            .unwrap();
        scene.commit(&fx.rt, &assets).await.unwrap();

        let ann = fx.mem.contact(ANN).unwrap();
        assert_eq!(ann.status, ContactStatus::Blocked);
        assert!(ann.group_ids.is_empty());
    }
}
