//! Keeps a contact's campaign fires in step with the values they are
//! relative to and the groups the campaigns target.

use std::collections::BTreeMap;

use chrono::Utc;
use mailroom_core_backend::{CampaignFireKey, CoreTx};
use mailroom_models::{CampaignPoint, ContactFire, GroupID, PointID, PointStatus};

use super::{HookResult, PreCommitHook, SceneBatch};
use crate::assets::OrgAssets;
use crate::campaigns::fire_time;
use crate::runtime::Runtime;
use crate::scene::Scene;

/// What changed about a contact that may move its campaign fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CampaignFireChange {
    Field(String),
    LastSeen,
    GroupAdded(GroupID),
    GroupRemoved(GroupID),
}

pub struct UpdateCampaignFires;

#[async_trait::async_trait]
impl PreCommitHook for UpdateCampaignFires {
    type Payload = CampaignFireChange;

    const NAME: &'static str = "update_campaign_fires";
    const ORDER: i32 = 50;

    async fn execute(
        &self,
        tx: &mut dyn CoreTx,
        _rt: &Runtime,
        assets: &OrgAssets,
        scenes: &SceneBatch<'_, Self::Payload>,
    ) -> HookResult<()> {
        for (scene, changes) in scenes {
            reschedule(tx, assets, scene, changes).await?;
        }
        Ok(())
    }
}

/// Delete and recreate the fires of every campaign point affected by the
/// changes. Points still being scheduled are left to the scheduling task.
pub(crate) async fn reschedule(
    tx: &mut dyn CoreTx,
    assets: &OrgAssets,
    scene: &Scene,
    changes: &[CampaignFireChange],
) -> HookResult<()> {
    let member_of = |group_id: GroupID| -> bool {
        for change in changes.iter().rev() {
            match change {
                CampaignFireChange::GroupAdded(id) if *id == group_id => return true,
                CampaignFireChange::GroupRemoved(id) if *id == group_id => return false,
                _ => {}
            }
        }
        assets
            .group_by_id(group_id)
            .is_some_and(|g| scene.contact().in_group(g.uuid))
    };

    let mut affected: BTreeMap<PointID, (&CampaignPoint, bool)> = BTreeMap::new();
    for campaign in assets.campaigns() {
        let member = member_of(campaign.group_id);
        for point in &campaign.points {
            let hit = changes.iter().any(|change| match change {
                CampaignFireChange::Field(key) => point.relative_to == *key,
                CampaignFireChange::LastSeen => point.relative_to == "last_seen_on",
                CampaignFireChange::GroupAdded(id) | CampaignFireChange::GroupRemoved(id) => {
                    *id == campaign.group_id
                }
            });
            if hit {
                affected.insert(point.id, (point, member));
            }
        }
    }
    if affected.is_empty() {
        return Ok(());
    }

    let keys: Vec<CampaignFireKey> = affected
        .keys()
        .map(|point_id| CampaignFireKey {
            contact_id: scene.contact_id(),
            point_id: *point_id,
        })
        .collect();
    tx.delete_campaign_fires(&keys).await?;

    let now = Utc::now();
    let fires: Vec<ContactFire> = affected
        .values()
        .filter(|(point, member)| *member && point.status == PointStatus::Ready)
        .filter_map(|(point, _)| {
            fire_time(assets.org(), point, scene.contact(), now).map(|fire_on| {
                ContactFire::new_campaign(
                    scene.org_id(),
                    scene.contact_id(),
                    point.id,
                    point.fire_version,
                    fire_on,
                )
            })
        })
        .collect();
    if !fires.is_empty() {
        tx.insert_fires(&fires).await?;
    }
    Ok(())
}
