//! Bulk commit of scenes.
//!
//! Every pre-commit hook runs once for the whole batch inside a single
//! transaction, in ascending hook order. Post-commit hooks run after the
//! transaction lands; their failures are logged and never surfaced since the
//! durable state is already in place.

use std::time::Instant;

use mailroom_core_backend::BackendError;
use tracing::{debug, error};

use crate::assets::OrgAssets;
use crate::hooks::{self, HookError};
use crate::runtime::Runtime;
use crate::scene::Scene;

#[derive(Debug, thiserror::Error)]
pub enum CommitError {
    #[error("scene for contact {0} has already been committed")]
    AlreadyCommitted(mailroom_models::ContactID),
    #[error("error beginning transaction: {0}")]
    Begin(#[source] BackendError),
    #[error("error applying {hook} hook: {source}")]
    Hook {
        hook: &'static str,
        #[source]
        source: HookError,
    },
    #[error("error committing transaction: {0}")]
    Commit(#[source] BackendError),
    #[error("commit timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl CommitError {
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Begin(err) | Self::Commit(err) => err.is_not_found(),
            Self::Hook { source, .. } => source.is_not_found(),
            _ => false,
        }
    }
}

/// What a bulk commit did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitSummary {
    pub scenes: usize,
    /// Pre-commit hooks that had payloads, in the order they ran.
    pub pre_hooks: Vec<&'static str>,
    pub post_hooks: Vec<&'static str>,
    /// Post-commit hooks that failed after the transaction committed.
    pub post_failures: Vec<&'static str>,
}

/// Apply the hooks of all scenes in one transaction, then run post-commit
/// hooks. Scenes are marked committed once the transaction lands.
pub async fn bulk_commit(
    rt: &Runtime,
    assets: &OrgAssets,
    scenes: &mut [Scene],
) -> Result<CommitSummary, CommitError> {
    if let Some(scene) = scenes.iter().find(|s| s.is_committed()) {
        return Err(CommitError::AlreadyCommitted(scene.contact_id()));
    }
    let mut summary = CommitSummary {
        scenes: scenes.len(),
        ..Default::default()
    };
    if scenes.is_empty() {
        return Ok(summary);
    }

    let started = Instant::now();
    let budget = rt.config.commit_timeout;
    {
        let refs: Vec<&Scene> = scenes.iter().collect();
        let applied = tokio::time::timeout(budget, apply_pre_hooks(rt, assets, &refs)).await;
        summary.pre_hooks = match applied {
            Ok(result) => result?,
            Err(_) => return Err(CommitError::Timeout(budget)),
        };
    }
    for scene in scenes.iter_mut() {
        scene.mark_committed();
    }

    let refs: Vec<&Scene> = scenes.iter().collect();
    for hook in hooks::post_hooks() {
        match hook.run(rt, assets, &refs).await {
            Ok(true) => summary.post_hooks.push(hook.name()),
            Ok(false) => {}
            Err(err) => {
                error!(hook = hook.name(), error = %err, "post-commit hook failed");
                summary.post_failures.push(hook.name());
            }
        }
    }

    debug!(
        org_id = %assets.org_id(),
        scenes = summary.scenes,
        pre_hooks = summary.pre_hooks.len(),
        post_hooks = summary.post_hooks.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "committed scenes"
    );
    Ok(summary)
}

async fn apply_pre_hooks(
    rt: &Runtime,
    assets: &OrgAssets,
    scenes: &[&Scene],
) -> Result<Vec<&'static str>, CommitError> {
    let mut tx = rt.db.begin().await.map_err(CommitError::Begin)?;
    let mut ran = Vec::new();
    for hook in hooks::pre_hooks() {
        let applied = hook
            .run(tx.as_mut(), rt, assets, scenes)
            .await
            .map_err(|source| CommitError::Hook {
                hook: hook.name(),
                source,
            })?;
        if applied {
            ran.push(hook.name());
        }
    }
    tx.commit().await.map_err(CommitError::Commit)?;
    Ok(ran)
}

#[cfg(test)]
mod tests {
    use mailroom_flows::{FieldRef, Modifier};

    use super::*;
    use crate::scene::Via;
    use crate::test_support::{self, ANN, BOB, ORG};

    fn set_age(value: &str) -> Modifier {
        Modifier::Field {
            field: FieldRef {
                key: "age".to_string(),
                name: "Age".to_string(),
            },
            value: Some(value.to_string()),
        }
    }

    #[tokio::test]
    async fn test_hooks_run_once_per_batch_in_order() {
        let fx = test_support::fixture().await;
        let assets = fx.rt.org_assets(ORG).await.unwrap();
        let mut scenes = vec![fx.scene(&assets, ANN), fx.scene(&assets, BOB)];
        for scene in &mut scenes {
            scene
                .apply_modifier(&fx.rt, &assets, &set_age("33"), None, Via::Api)
                .unwrap();
        }
        fx.mem.clear_tx_log();

        let summary = bulk_commit(&fx.rt, &assets, &mut scenes).await.unwrap();
        assert_eq!(summary.scenes, 2);
        assert_eq!(
            summary.pre_hooks,
            vec![
                "update_contact_fields",
                "recalculate_smart_groups",
                "update_contact_modified_on",
                "update_campaign_fires"
            ]
        );

        // one write per hook, covering both contacts
        let log = fx.mem.tx_log();
        assert_eq!(log.iter().filter(|op| *op == "update_contact_fields").count(), 1);
        assert_eq!(log.iter().filter(|op| *op == "update_contacts_modified_on").count(), 1);
        assert_eq!(fx.mem.contact(ANN).unwrap().fields["age"].text, "33");
        assert_eq!(fx.mem.contact(BOB).unwrap().fields["age"].text, "33");
        assert!(scenes.iter().all(Scene::is_committed));
    }

    #[tokio::test]
    async fn test_failing_hook_rolls_back_everything() {
        let fx = test_support::fixture().await;
        let assets = fx.rt.org_assets(ORG).await.unwrap();
        let before = fx.mem.contact(ANN).unwrap();

        let mut scene = fx.scene(&assets, ANN);
        scene
            .start_session(
                &fx.rt,
                &assets,
                fx.manual_trigger(&assets, test_support::FAVORITES),
                false,
            )
            .await
            .unwrap();
        fx.mem.fail_op("insert_msgs");

        let err = scene.commit(&fx.rt, &assets).await.unwrap_err();
        assert!(matches!(err, CommitError::Hook { hook: "insert_messages", .. }));
        assert!(!scene.is_committed());

        let store = fx.mem.snapshot();
        assert!(store.sessions.is_empty());
        assert!(store.msgs.is_empty());
        assert!(store.tx_log.is_empty());
        let after = fx.mem.contact(ANN).unwrap();
        assert_eq!(after.current_session_uuid, before.current_session_uuid);
        assert_eq!(after.modified_on, before.modified_on);
    }

    #[tokio::test]
    async fn test_post_hook_failure_is_not_surfaced() {
        let fx = test_support::fixture().await;
        let assets = fx.rt.org_assets(ORG).await.unwrap();
        let mut scene = fx.scene(&assets, ANN);
        scene
            .start_session(
                &fx.rt,
                &assets,
                fx.manual_trigger(&assets, test_support::FAVORITES),
                false,
            )
            .await
            .unwrap();
        fx.mem.fail_op("list_push");

        let summary = scene.commit(&fx.rt, &assets).await.unwrap();
        assert_eq!(summary.post_failures, vec!["send_messages"]);
        assert_eq!(fx.mem.msgs().len(), 1);
    }

    #[tokio::test]
    async fn test_committed_scene_is_rejected() {
        let fx = test_support::fixture().await;
        let assets = fx.rt.org_assets(ORG).await.unwrap();
        let mut scene = fx.scene(&assets, ANN);
        scene
            .apply_modifier(&fx.rt, &assets, &set_age("50"), None, Via::Api)
            .unwrap();
        scene.commit(&fx.rt, &assets).await.unwrap();

        let err = scene.commit(&fx.rt, &assets).await.unwrap_err();
        assert!(matches!(err, CommitError::AlreadyCommitted(id) if id == ANN));
    }

    #[tokio::test]
    async fn test_empty_batch_opens_no_transaction() {
        let fx = test_support::fixture().await;
        let assets = fx.rt.org_assets(ORG).await.unwrap();
        fx.mem.fail_op("begin");
        let summary = bulk_commit(&fx.rt, &assets, &mut []).await.unwrap();
        assert_eq!(summary, CommitSummary::default());
    }
}
