//! Front-door operations.
//!
//! Everything that changes contacts from outside a sprint goes through here:
//! lock the contacts, load them into scenes, drive the engine, commit the
//! batch, release the locks. Contacts that can't be locked in time are
//! reported as skipped and left for the caller to retry.

use std::collections::BTreeMap;
use std::time::Duration;

use mailroom_core_backend::BackendError;
use mailroom_flows::{Event, FlowContact, Modifier, Resume, Trigger};
use mailroom_kv_backend::KvError;
use mailroom_models::{ContactID, SessionStatus, SessionUUID, StartMode, UserID};
use tracing::{debug, warn};

use crate::assets::OrgAssets;
use crate::commit::{CommitError, bulk_commit};
use crate::locker::{self, ContactLock};
use crate::runtime::Runtime;
use crate::scene::{Scene, SceneError, Via};

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error(transparent)]
    Kv(#[from] KvError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Scene(#[from] SceneError),
    #[error(transparent)]
    Commit(#[from] CommitError),
}

impl RunnerError {
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Backend(err) => err.is_not_found(),
            Self::Scene(err) => err.is_not_found(),
            Self::Commit(err) => err.is_not_found(),
            Self::Kv(_) => false,
        }
    }
}

pub type RunnerResult<T> = Result<T, RunnerError>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartResult {
    /// Sessions started, per contact.
    pub sessions: Vec<(ContactID, SessionUUID)>,
    /// Contacts whose lock couldn't be obtained.
    pub skipped: Vec<ContactID>,
    /// Contacts left alone because they were already in a flow.
    pub bypassed: Vec<ContactID>,
    /// Contacts the engine couldn't start.
    pub failed: Vec<ContactID>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterruptResult {
    pub interrupted: Vec<ContactID>,
    pub skipped: Vec<ContactID>,
}

#[derive(Debug, Clone, Default)]
pub struct ModifyResult {
    pub events: BTreeMap<ContactID, Vec<Event>>,
    pub skipped: Vec<ContactID>,
}

/// Load contacts with their open tickets into fresh scenes. Contacts that
/// no longer exist are left out.
pub async fn load_scenes(
    rt: &Runtime,
    assets: &OrgAssets,
    contact_ids: &[ContactID],
) -> RunnerResult<Vec<Scene>> {
    if contact_ids.is_empty() {
        return Ok(Vec::new());
    }
    let org_id = assets.org_id();
    let contacts = rt.db.load_contacts(org_id, contact_ids).await?;
    let mut tickets = rt.db.load_open_tickets(org_id, contact_ids).await?;

    Ok(contacts
        .into_iter()
        .map(|contact| {
            let (mine, rest) = tickets.drain(..).partition(|t| t.contact_id == contact.id);
            tickets = rest;
            Scene::for_contact(assets, contact, mine)
        })
        .collect())
}

async fn release_all(locks: Vec<ContactLock>) {
    for lock in locks {
        lock.release().await;
    }
}

/// Start sessions for contacts, building each trigger from the contact.
///
/// `Interrupt` ends whatever the contact is waiting in first; `Skip` leaves
/// waiting contacts alone; `Passive` starts without interrupting, so only a
/// session that itself ends up waiting takes the contact over.
pub async fn start_with_lock(
    rt: &Runtime,
    assets: &OrgAssets,
    contact_ids: &[ContactID],
    build_trigger: impl Fn(&FlowContact) -> Trigger,
    mode: StartMode,
    lock_wait: Duration,
) -> RunnerResult<StartResult> {
    let (locks, skipped) = locker::lock_contacts(rt, contact_ids, lock_wait).await?;
    let locked: Vec<ContactID> = locks.iter().map(ContactLock::contact_id).collect();
    let mut result = StartResult {
        skipped,
        ..Default::default()
    };

    let mut scenes = Vec::with_capacity(locked.len());
    for mut scene in load_scenes(rt, assets, &locked).await? {
        if mode == StartMode::Skip && scene.db_contact().is_waiting() {
            result.bypassed.push(scene.contact_id());
            continue;
        }
        let trigger = build_trigger(scene.contact());
        match scene
            .start_session(rt, assets, trigger, mode == StartMode::Interrupt)
            .await
        {
            Ok(()) => scenes.push(scene),
            Err(SceneError::Engine(err)) => {
                warn!(contact_id = %scene.contact_id(), error = %err, "engine failed to start session");
                result.failed.push(scene.contact_id());
            }
            Err(err) => return Err(err.into()),
        }
    }

    bulk_commit(rt, assets, &mut scenes).await?;
    release_all(locks).await;

    result.sessions = scenes
        .iter()
        .filter_map(|s| s.session().map(|session| (s.contact_id(), session.uuid)))
        .collect();
    debug!(
        started = result.sessions.len(),
        skipped = result.skipped.len(),
        bypassed = result.bypassed.len(),
        "started sessions"
    );
    Ok(result)
}

/// Resume a waiting session in a scene whose contact the caller has locked.
/// Sessions whose flow is gone, or that the engine can't resume, are ended
/// as failed so the contact is free to start something else. Returns false
/// when the session wasn't waiting.
pub async fn resume_session(
    rt: &Runtime,
    assets: &OrgAssets,
    scene: &mut Scene,
    row: &mailroom_models::Session,
    resume: Resume,
) -> RunnerResult<bool> {
    if row.status != SessionStatus::Waiting {
        debug!(session_uuid = %row.uuid, status = %row.status, "session no longer waiting, ignoring resume");
        return Ok(false);
    }

    let flow_usable = row
        .current_flow_uuid
        .and_then(|uuid| assets.flow_by_uuid(uuid))
        .is_some_and(|flow| flow.is_active);
    if !flow_usable {
        warn!(session_uuid = %row.uuid, "session flow is gone, failing session");
        scene
            .interrupt_waiting(rt, assets, SessionStatus::Failed)
            .await?;
        scene.commit(rt, assets).await?;
        return Ok(true);
    }

    match scene.resume_session(rt, assets, row, resume).await {
        Ok(()) => {}
        Err(SceneError::Engine(err)) => {
            warn!(session_uuid = %row.uuid, error = %err, "engine failed to resume, failing session");
            scene
                .interrupt_waiting(rt, assets, SessionStatus::Failed)
                .await?;
        }
        Err(SceneError::Serialization(err)) => {
            warn!(session_uuid = %row.uuid, error = %err, "unreadable session, failing it");
            scene
                .interrupt_waiting(rt, assets, SessionStatus::Failed)
                .await?;
        }
        Err(err) => return Err(err.into()),
    }
    scene.commit(rt, assets).await?;
    Ok(true)
}

/// End the waiting sessions of contacts. With a filter, only contacts
/// currently waiting in one of those sessions are touched. `Interrupted`
/// interrupts the contact outright; other statuses end just the waiting
/// session with that status.
pub async fn interrupt_with_lock(
    rt: &Runtime,
    assets: &OrgAssets,
    contact_ids: &[ContactID],
    session_filter: Option<&[SessionUUID]>,
    status: SessionStatus,
) -> RunnerResult<InterruptResult> {
    let (locks, skipped) =
        locker::lock_contacts(rt, contact_ids, locker::TASK_LOCK_WAIT).await?;
    let locked: Vec<ContactID> = locks.iter().map(ContactLock::contact_id).collect();

    let mut scenes = Vec::with_capacity(locked.len());
    for mut scene in load_scenes(rt, assets, &locked).await? {
        if let Some(filter) = session_filter {
            let current = scene.db_contact().current_session_uuid;
            if !current.is_some_and(|uuid| filter.contains(&uuid)) {
                continue;
            }
        }
        if status == SessionStatus::Interrupted {
            scene.interrupt_contact(rt, assets).await?;
        } else {
            scene.interrupt_waiting(rt, assets, status).await?;
        }
        scenes.push(scene);
    }

    bulk_commit(rt, assets, &mut scenes).await?;
    release_all(locks).await;

    Ok(InterruptResult {
        interrupted: scenes.iter().map(Scene::contact_id).collect(),
        skipped,
    })
}

async fn modify_scenes(
    rt: &Runtime,
    assets: &OrgAssets,
    mut scenes: Vec<Scene>,
    modifiers: &[Modifier],
    user_id: Option<UserID>,
    via: Via,
) -> RunnerResult<BTreeMap<ContactID, Vec<Event>>> {
    let mut events = BTreeMap::new();
    for scene in &mut scenes {
        let mut produced = Vec::new();
        for modifier in modifiers {
            produced.extend(scene.apply_modifier(rt, assets, modifier, user_id, via)?);
        }
        events.insert(scene.contact_id(), produced);
    }
    bulk_commit(rt, assets, &mut scenes).await?;
    Ok(events)
}

/// Apply modifiers to contacts, returning the events each contact produced.
pub async fn modify_with_lock(
    rt: &Runtime,
    assets: &OrgAssets,
    contact_ids: &[ContactID],
    modifiers: &[Modifier],
    user_id: Option<UserID>,
    via: Via,
) -> RunnerResult<ModifyResult> {
    let (locks, skipped) =
        locker::lock_contacts(rt, contact_ids, locker::TASK_LOCK_WAIT).await?;
    let locked: Vec<ContactID> = locks.iter().map(ContactLock::contact_id).collect();

    let scenes = load_scenes(rt, assets, &locked).await?;
    let events = modify_scenes(rt, assets, scenes, modifiers, user_id, via).await?;
    release_all(locks).await;

    Ok(ModifyResult { events, skipped })
}

/// Like [`modify_with_lock`] for contacts nothing else can be writing to
/// yet, such as ones being created or imported.
pub async fn modify_without_lock(
    rt: &Runtime,
    assets: &OrgAssets,
    contact_ids: &[ContactID],
    modifiers: &[Modifier],
    user_id: Option<UserID>,
    via: Via,
) -> RunnerResult<BTreeMap<ContactID, Vec<Event>>> {
    let scenes = load_scenes(rt, assets, contact_ids).await?;
    modify_scenes(rt, assets, scenes, modifiers, user_id, via).await
}

#[cfg(test)]
mod tests {
    use mailroom_flows::FlowRef;
    use mailroom_models::FlowType;

    use super::*;
    use crate::locker::lock_contact;
    use crate::test_support::{self, ANN, BOB, CAT, FAVORITES, ORG, VOICE_FLOW};

    fn favorites(assets: &OrgAssets) -> impl Fn(&FlowContact) -> Trigger + '_ {
        move |_| Trigger::Manual {
            flow: FlowRef::from(assets.flow_by_id(FAVORITES).unwrap()),
            params: None,
            user: None,
        }
    }

    #[tokio::test]
    async fn test_locked_contacts_are_skipped_and_not_started() {
        let fx = test_support::fixture().await;
        let assets = fx.rt.org_assets(ORG).await.unwrap();
        let held = lock_contact(&fx.rt, ANN, Duration::ZERO).await.unwrap().unwrap();

        let result = start_with_lock(
            &fx.rt,
            &assets,
            &[ANN, BOB],
            favorites(&assets),
            StartMode::Interrupt,
            Duration::from_millis(50),
        )
        .await
        .unwrap();
        held.release().await;

        assert_eq!(result.skipped, vec![ANN]);
        assert_eq!(result.sessions.len(), 1);
        assert_eq!(result.sessions[0].0, BOB);
        let store = fx.mem.snapshot();
        assert!(store.sessions.values().all(|s| s.contact_id != ANN));
        assert!(fx.mem.contact(ANN).unwrap().current_session_uuid.is_none());
        assert_eq!(
            fx.mem.contact(BOB).unwrap().current_session_uuid,
            Some(result.sessions[0].1)
        );
    }

    #[tokio::test]
    async fn test_skip_mode_bypasses_waiting_contacts() {
        let fx = test_support::fixture().await;
        let assets = fx.rt.org_assets(ORG).await.unwrap();
        let waiting = fx.start_favorites(ANN).await;

        let result = start_with_lock(
            &fx.rt,
            &assets,
            &[ANN, BOB, CAT],
            favorites(&assets),
            StartMode::Skip,
            Duration::from_secs(1),
        )
        .await
        .unwrap();

        assert_eq!(result.bypassed, vec![ANN]);
        let started: Vec<ContactID> = result.sessions.iter().map(|(c, _)| *c).collect();
        assert_eq!(started, vec![BOB, CAT]);
        assert_eq!(fx.mem.contact(ANN).unwrap().current_session_uuid, Some(waiting));
    }

    #[tokio::test]
    async fn test_skip_mode_bypasses_contacts_in_calls() {
        let fx = test_support::fixture().await;
        let assets = fx.rt.org_assets(ORG).await.unwrap();
        let voice_uuid = assets.flow_by_id(VOICE_FLOW).unwrap().uuid;
        let waiting = fx.start_favorites(ANN).await;
        fx.mem.seed(|store| {
            let session = store.sessions.get_mut(&waiting).unwrap();
            session.session_type = FlowType::Voice;
            session.current_flow_uuid = Some(voice_uuid);
        });

        let result = start_with_lock(
            &fx.rt,
            &assets,
            &[ANN, BOB],
            favorites(&assets),
            StartMode::Skip,
            Duration::from_secs(1),
        )
        .await
        .unwrap();

        assert_eq!(result.bypassed, vec![ANN]);
        assert_eq!(result.sessions.len(), 1);
        assert_eq!(result.sessions[0].0, BOB);
        let session = fx.mem.session(waiting).unwrap();
        assert_eq!(session.status, SessionStatus::Waiting);
        assert_eq!(session.session_type, FlowType::Voice);
        assert_eq!(fx.mem.contact(ANN).unwrap().current_session_uuid, Some(waiting));
    }

    #[tokio::test]
    async fn test_interrupt_mode_replaces_waiting_session() {
        let fx = test_support::fixture().await;
        let assets = fx.rt.org_assets(ORG).await.unwrap();
        let old = fx.start_favorites(ANN).await;

        let result = start_with_lock(
            &fx.rt,
            &assets,
            &[ANN],
            favorites(&assets),
            StartMode::Interrupt,
            Duration::from_secs(1),
        )
        .await
        .unwrap();

        let new = result.sessions[0].1;
        assert_ne!(old, new);
        assert_eq!(fx.mem.session(old).unwrap().status, SessionStatus::Interrupted);
        assert_eq!(fx.mem.session(new).unwrap().status, SessionStatus::Waiting);
        assert_eq!(fx.mem.contact(ANN).unwrap().current_session_uuid, Some(new));
        assert_eq!(fx.mem.session(new).unwrap().session_type, FlowType::Messaging);
    }

    #[tokio::test]
    async fn test_resume_fails_session_when_flow_is_gone() {
        let fx = test_support::fixture().await;
        let session_uuid = fx.start_favorites(ANN).await;
        fx.mem.seed(|store| {
            for flow in &mut store.org_rows(ORG).flows {
                if flow.id == FAVORITES {
                    flow.is_active = false;
                }
            }
        });
        fx.rt.assets.invalidate(ORG);
        let assets = fx.rt.org_assets(ORG).await.unwrap();

        let row = fx.mem.session(session_uuid).unwrap();
        let mut scene = fx.scene(&assets, ANN);
        let resumed = resume_session(&fx.rt, &assets, &mut scene, &row, Resume::WaitTimeout {})
            .await
            .unwrap();

        assert!(resumed);
        assert_eq!(fx.mem.session(session_uuid).unwrap().status, SessionStatus::Failed);
        assert!(fx.mem.contact(ANN).unwrap().current_session_uuid.is_none());
    }

    #[tokio::test]
    async fn test_resume_of_ended_session_is_a_noop() {
        let fx = test_support::fixture().await;
        let assets = fx.rt.org_assets(ORG).await.unwrap();
        let session_uuid = fx.start_favorites(ANN).await;
        let mut row = fx.mem.session(session_uuid).unwrap();
        row.status = SessionStatus::Completed;

        let mut scene = fx.scene(&assets, ANN);
        let resumed = resume_session(&fx.rt, &assets, &mut scene, &row, Resume::WaitTimeout {})
            .await
            .unwrap();
        assert!(!resumed);
        assert!(!scene.is_committed());
    }

    #[tokio::test]
    async fn test_interrupt_respects_session_filter() {
        let fx = test_support::fixture().await;
        let assets = fx.rt.org_assets(ORG).await.unwrap();
        let ann_session = fx.start_favorites(ANN).await;
        let bob_session = fx.start_favorites(BOB).await;

        let result = interrupt_with_lock(
            &fx.rt,
            &assets,
            &[ANN, BOB],
            Some(&[bob_session]),
            SessionStatus::Interrupted,
        )
        .await
        .unwrap();

        assert_eq!(result.interrupted, vec![BOB]);
        assert_eq!(fx.mem.session(ann_session).unwrap().status, SessionStatus::Waiting);
        assert_eq!(fx.mem.session(bob_session).unwrap().status, SessionStatus::Interrupted);
        assert!(fx.mem.contact(BOB).unwrap().current_session_uuid.is_none());
    }

    #[tokio::test]
    async fn test_modify_with_lock_returns_events_per_contact() {
        let fx = test_support::fixture().await;
        let assets = fx.rt.org_assets(ORG).await.unwrap();
        let result = modify_with_lock(
            &fx.rt,
            &assets,
            &[ANN, BOB],
            &[Modifier::Language {
                language: Some("fra".to_string()),
            }],
            None,
            Via::Api,
        )
        .await
        .unwrap();

        assert!(result.skipped.is_empty());
        assert_eq!(result.events[&ANN].len(), 1);
        assert_eq!(result.events[&ANN][0].type_name(), "contact_language_changed");
        assert_eq!(fx.mem.contact(BOB).unwrap().language.as_deref(), Some("fra"));
    }
}
