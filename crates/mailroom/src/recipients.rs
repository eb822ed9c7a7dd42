//! Resolving who a flow start or broadcast goes to.

use std::collections::BTreeSet;

use chrono::{Duration, Utc};
use mailroom_flows::EngineError;
use mailroom_models::{
    Broadcast, Contact, ContactID, ContactStatus, Exclusions, FlowID, FlowStart, GroupID, URN,
};

use crate::assets::OrgAssets;
use crate::runtime::Runtime;
use crate::scene::flow_contact;
use crate::tasks::TaskResult;

const LOAD_BATCH: usize = 500;

/// The ways a start or broadcast names its contacts.
#[derive(Debug, Clone, Copy)]
pub struct Recipients<'a> {
    pub contact_ids: &'a [ContactID],
    pub group_ids: &'a [GroupID],
    pub urns: &'a [URN],
    pub query: Option<&'a str>,
    pub exclusions: &'a Exclusions,
}

impl<'a> Recipients<'a> {
    pub fn for_start(start: &'a FlowStart) -> Self {
        Self {
            contact_ids: &start.contact_ids,
            group_ids: &start.group_ids,
            urns: &start.urns,
            query: start.query.as_deref().filter(|q| !q.trim().is_empty()),
            exclusions: &start.exclusions,
        }
    }

    pub fn for_broadcast(broadcast: &'a Broadcast) -> Self {
        Self {
            contact_ids: &broadcast.contact_ids,
            group_ids: &broadcast.group_ids,
            urns: &broadcast.urns,
            query: broadcast.query.as_deref().filter(|q| !q.trim().is_empty()),
            exclusions: &broadcast.exclusions,
        }
    }
}

/// Resolve recipients to existing contact ids, in id order. `flow_id` is
/// the flow being started, used by the started-previously exclusion.
pub async fn resolve(
    rt: &Runtime,
    assets: &OrgAssets,
    recipients: &Recipients<'_>,
    flow_id: Option<FlowID>,
) -> TaskResult<Vec<ContactID>> {
    let org_id = assets.org_id();
    let mut ids: BTreeSet<ContactID> = recipients.contact_ids.iter().copied().collect();

    for &group_id in recipients.group_ids {
        ids.extend(rt.db.load_group_contact_ids(org_id, group_id).await?);
    }
    if !recipients.urns.is_empty() {
        ids.extend(rt.db.load_contact_ids_by_urns(org_id, recipients.urns).await?);
    }
    if let Some(query) = recipients.query {
        let candidates = rt.db.load_active_contact_ids(org_id).await?;
        for contact in load_all(rt, assets, &candidates).await? {
            let view = flow_contact(assets, &contact, &[]);
            if rt.engine.contact_matches_query(&view, query)? {
                ids.insert(contact.id);
            }
        }
    }

    let exclusions = recipients.exclusions;
    let ids: Vec<ContactID> = ids.into_iter().collect();
    if *exclusions == Exclusions::default() {
        return Ok(ids);
    }

    let started: BTreeSet<ContactID> = match flow_id {
        Some(flow_id) if exclusions.started_previously => rt
            .db
            .load_flow_contact_ids(org_id, flow_id)
            .await?
            .into_iter()
            .collect(),
        _ => BTreeSet::new(),
    };
    let seen_since = (exclusions.not_seen_since_days > 0)
        .then(|| Utc::now() - Duration::days(i64::from(exclusions.not_seen_since_days)));

    Ok(load_all(rt, assets, &ids)
        .await?
        .into_iter()
        .filter(|c| !exclusions.non_active || c.status == ContactStatus::Active)
        .filter(|c| !exclusions.in_a_flow || !c.is_waiting())
        .filter(|c| !started.contains(&c.id))
        .filter(|c| match seen_since {
            Some(since) => c.last_seen_on.is_some_and(|seen| seen >= since),
            None => true,
        })
        .map(|c| c.id)
        .collect())
}

async fn load_all(
    rt: &Runtime,
    assets: &OrgAssets,
    ids: &[ContactID],
) -> TaskResult<Vec<Contact>> {
    let mut contacts = Vec::with_capacity(ids.len());
    for chunk in ids.chunks(LOAD_BATCH) {
        contacts.extend(rt.db.load_contacts(assets.org_id(), chunk).await?);
    }
    Ok(contacts)
}

/// Whether an engine error is the caller's fault rather than ours.
pub fn is_bad_query(err: &crate::tasks::TaskError) -> bool {
    matches!(
        err,
        crate::tasks::TaskError::Engine(EngineError::InvalidQuery { .. })
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{self, ANN, BOB, CAT, DOCTORS, FAVORITES, ORG};

    fn none() -> Exclusions {
        Exclusions::default()
    }

    #[tokio::test]
    async fn test_ids_groups_and_urns_are_merged() {
        let fx = test_support::fixture().await;
        let assets = fx.rt.org_assets(ORG).await.unwrap();
        let urns = vec![URN::parse("tel:+16055741111").unwrap()];
        let exclusions = none();
        let recipients = Recipients {
            contact_ids: &[CAT],
            group_ids: &[DOCTORS],
            urns: &urns,
            query: None,
            exclusions: &exclusions,
        };
        let ids = resolve(&fx.rt, &assets, &recipients, None).await.unwrap();
        assert_eq!(ids, vec![ANN, CAT]);
    }

    #[tokio::test]
    async fn test_exclusions_filter_contacts() {
        let fx = test_support::fixture().await;
        let assets = fx.rt.org_assets(ORG).await.unwrap();
        fx.start_favorites(BOB).await;
        let flow_id = FAVORITES;

        let exclusions = Exclusions {
            in_a_flow: true,
            ..none()
        };
        let recipients = Recipients {
            contact_ids: &[ANN, BOB, CAT],
            group_ids: &[],
            urns: &[],
            query: None,
            exclusions: &exclusions,
        };
        assert_eq!(
            resolve(&fx.rt, &assets, &recipients, Some(flow_id)).await.unwrap(),
            vec![ANN, CAT]
        );

        let exclusions = Exclusions {
            started_previously: true,
            ..none()
        };
        let recipients = Recipients {
            exclusions: &exclusions,
            ..recipients
        };
        assert_eq!(
            resolve(&fx.rt, &assets, &recipients, Some(flow_id)).await.unwrap(),
            vec![ANN, CAT]
        );

        let exclusions = Exclusions {
            not_seen_since_days: 30,
            ..none()
        };
        let recipients = Recipients {
            exclusions: &exclusions,
            ..recipients
        };
        assert!(resolve(&fx.rt, &assets, &recipients, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_bad_query_is_recognized() {
        let fx = test_support::fixture().await;
        let assets = fx.rt.org_assets(ORG).await.unwrap();
        let exclusions = none();
        let recipients = Recipients {
            contact_ids: &[],
            group_ids: &[],
            urns: &[],
            query: Some("age"),
            exclusions: &exclusions,
        };
        let err = resolve(&fx.rt, &assets, &recipients, None).await.unwrap_err();
        assert!(is_bad_query(&err));
    }
}
