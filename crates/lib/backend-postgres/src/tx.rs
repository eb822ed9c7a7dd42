use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use mailroom_core_backend::{
    BackendError, BackendResult, CampaignFireKey, ContactFieldUpdate, ContactSessionUpdate,
    ContactURNsUpdate, CoreTx, GroupMembership, MsgDeletion, MsgHandled, MsgLabel,
    MsgStatusUpdate, ResthookUnsubscribe,
};
use mailroom_models::{
    AirtimeTransfer, Broadcast, BroadcastID, Call, CallID, ContactFire, ContactID, ContactStatus,
    FireID, FireType, FlowActivityCount, FlowRun, HttpLog, Incident, IncidentID, Msg, MsgID,
    Notification, OrgID, PointID, PointStatus, RunStatus, SESSION_FIRE_TYPES, Session,
    SessionStatus, SessionUUID, StartID, StartStatus, Ticket, TicketEvent, TicketID,
};
use sqlx::{Encode, Postgres, QueryBuilder, Row, Transaction, Type};
use uuid::Uuid;

use crate::codec;
use crate::{BatchSizeCounts, PostgresBackend, QueryCounts};

/// An open postgres transaction. Dropping it without committing rolls back.
pub struct PgTx {
    tx: Transaction<'static, Postgres>,
    query_counts: QueryCounts,
    batch_size_counts: BatchSizeCounts,
}

impl PgTx {
    pub(crate) fn new(
        tx: Transaction<'static, Postgres>,
        query_counts: QueryCounts,
        batch_size_counts: BatchSizeCounts,
    ) -> Self {
        Self {
            tx,
            query_counts,
            batch_size_counts,
        }
    }

    fn count(&self, label: &str, size: usize) {
        PostgresBackend::count_query(&self.query_counts, label);
        PostgresBackend::count_batch_size(&self.batch_size_counts, label, size);
    }

    /// Set one column on many contacts, bumping `modified_on`.
    async fn update_contact_column<T>(
        &mut self,
        label: &str,
        column: &'static str,
        rows: Vec<(i64, T)>,
    ) -> BackendResult<()>
    where
        T: for<'q> Encode<'q, Postgres> + Type<Postgres> + Send + 'static,
    {
        if rows.is_empty() {
            return Ok(());
        }
        self.count(label, rows.len());
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "UPDATE contacts AS c SET {column} = v.value, modified_on = NOW() FROM ("
        ));
        builder.push_values(rows, |mut b, (id, value)| {
            b.push_bind(id).push_bind(value);
        });
        builder.push(") AS v(id, value) WHERE c.id = v.id");
        builder.build().execute(&mut *self.tx).await?;
        Ok(())
    }
}

/// Keep the last row per key, preserving first-seen order.
fn last_per_key<T: Clone, K: std::hash::Hash + Eq>(rows: &[T], key: impl Fn(&T) -> K) -> Vec<T> {
    let mut index: HashMap<K, usize> = HashMap::new();
    let mut out: Vec<T> = Vec::with_capacity(rows.len());
    for row in rows {
        match index.get(&key(row)) {
            Some(&i) => out[i] = row.clone(),
            None => {
                index.insert(key(row), out.len());
                out.push(row.clone());
            }
        }
    }
    out
}

#[async_trait::async_trait]
impl CoreTx for PgTx {
    async fn commit(self: Box<Self>) -> BackendResult<()> {
        PostgresBackend::count_query(&self.query_counts, "commit");
        self.tx.commit().await?;
        Ok(())
    }

    async fn insert_sessions(&mut self, sessions: &[Session]) -> BackendResult<()> {
        if sessions.is_empty() {
            return Ok(());
        }
        self.count("insert:flow_sessions", sessions.len());
        let mut payloads = Vec::with_capacity(sessions.len());
        for s in sessions {
            payloads.push((
                s.uuid.0,
                s.org_id.0,
                s.contact_id.0,
                codec::enum_text(&s.session_type)?,
                codec::enum_text(&s.status)?,
                s.current_flow_uuid.map(|u| u.0),
                s.last_sprint_uuid.map(|u| u.0),
                s.output.clone(),
                s.call_id.map(|id| id.0),
                s.created_on,
                s.ended_on,
            ));
        }
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO flow_sessions (uuid, org_id, contact_id, session_type, status, current_flow_uuid, \
             last_sprint_uuid, output, call_id, created_on, ended_on) ",
        );
        builder.push_values(
            payloads,
            |mut b,
             (
                uuid,
                org_id,
                contact_id,
                session_type,
                status,
                current_flow,
                last_sprint,
                output,
                call_id,
                created_on,
                ended_on,
            )| {
                b.push_bind(uuid)
                    .push_bind(org_id)
                    .push_bind(contact_id)
                    .push_bind(session_type)
                    .push_bind(status)
                    .push_bind(current_flow)
                    .push_bind(last_sprint)
                    .push_bind(output)
                    .push_bind(call_id)
                    .push_bind(created_on)
                    .push_bind(ended_on);
            },
        );
        builder.build().execute(&mut *self.tx).await?;
        Ok(())
    }

    async fn update_sessions(&mut self, sessions: &[Session]) -> BackendResult<()> {
        if sessions.is_empty() {
            return Ok(());
        }
        let sessions = last_per_key(sessions, |s| s.uuid);
        self.count("update:flow_sessions", sessions.len());
        let mut payloads = Vec::with_capacity(sessions.len());
        for s in &sessions {
            payloads.push((
                s.uuid.0,
                codec::enum_text(&s.status)?,
                s.current_flow_uuid.map(|u| u.0),
                s.last_sprint_uuid.map(|u| u.0),
                s.output.clone(),
                s.ended_on,
            ));
        }
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "UPDATE flow_sessions AS s SET status = v.status, current_flow_uuid = v.current_flow_uuid, \
             last_sprint_uuid = v.last_sprint_uuid, output = v.output, ended_on = v.ended_on FROM (",
        );
        builder.push_values(
            payloads,
            |mut b, (uuid, status, current_flow, last_sprint, output, ended_on)| {
                b.push_bind(uuid)
                    .push_bind(status)
                    .push_bind(current_flow)
                    .push_bind(last_sprint)
                    .push_bind(output)
                    .push_bind(ended_on);
            },
        );
        builder.push(
            ") AS v(uuid, status, current_flow_uuid, last_sprint_uuid, output, ended_on) \
             WHERE s.uuid = v.uuid",
        );
        builder.build().execute(&mut *self.tx).await?;
        Ok(())
    }

    async fn end_waiting_sessions(
        &mut self,
        contact_ids: &[ContactID],
        status: SessionStatus,
        now: DateTime<Utc>,
    ) -> BackendResult<Vec<SessionUUID>> {
        if contact_ids.is_empty() || !status.is_terminal() {
            return Ok(Vec::new());
        }
        self.count("update:end_waiting_sessions", contact_ids.len());
        let ids: Vec<i64> = contact_ids.iter().map(|id| id.0).collect();
        let uuids: Vec<Uuid> = sqlx::query_scalar(
            "UPDATE flow_sessions SET status = $1, ended_on = $2, current_flow_uuid = NULL \
             WHERE contact_id = ANY($3) AND status = 'waiting' RETURNING uuid",
        )
        .bind(codec::enum_text(&status)?)
        .bind(now)
        .bind(&ids)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(uuids.into_iter().map(SessionUUID).collect())
    }

    async fn end_sessions(
        &mut self,
        uuids: &[SessionUUID],
        status: SessionStatus,
        now: DateTime<Utc>,
    ) -> BackendResult<()> {
        if uuids.is_empty() || !status.is_terminal() {
            return Ok(());
        }
        self.count("update:end_sessions", uuids.len());
        let uuids: Vec<Uuid> = uuids.iter().map(|u| u.0).collect();
        sqlx::query(
            "UPDATE flow_sessions SET status = $1, ended_on = $2, current_flow_uuid = NULL \
             WHERE uuid = ANY($3) AND status = 'waiting'",
        )
        .bind(codec::enum_text(&status)?)
        .bind(now)
        .bind(&uuids)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn upsert_runs(&mut self, runs: &[FlowRun]) -> BackendResult<()> {
        if runs.is_empty() {
            return Ok(());
        }
        let runs = last_per_key(runs, |r| r.uuid);
        self.count("upsert:flow_runs", runs.len());
        let mut payloads = Vec::with_capacity(runs.len());
        for r in &runs {
            payloads.push((
                r.uuid.0,
                r.org_id.0,
                r.contact_id.0,
                r.flow_id.0,
                r.session_uuid.0,
                codec::enum_text(&r.status)?,
                r.responded,
                r.results.clone(),
                r.path_nodes.iter().map(|n| n.0).collect::<Vec<Uuid>>(),
                r.created_on,
                r.modified_on,
                r.exited_on,
            ));
        }
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO flow_runs (uuid, org_id, contact_id, flow_id, session_uuid, status, responded, \
             results, path_nodes, created_on, modified_on, exited_on) ",
        );
        builder.push_values(
            payloads,
            |mut b,
             (
                uuid,
                org_id,
                contact_id,
                flow_id,
                session_uuid,
                status,
                responded,
                results,
                path,
                created_on,
                modified_on,
                exited_on,
            )| {
                b.push_bind(uuid)
                    .push_bind(org_id)
                    .push_bind(contact_id)
                    .push_bind(flow_id)
                    .push_bind(session_uuid)
                    .push_bind(status)
                    .push_bind(responded)
                    .push_bind(results)
                    .push_bind(path)
                    .push_bind(created_on)
                    .push_bind(modified_on)
                    .push_bind(exited_on);
            },
        );
        builder.push(
            " ON CONFLICT (uuid) DO UPDATE SET status = EXCLUDED.status, responded = EXCLUDED.responded, \
             results = EXCLUDED.results, path_nodes = EXCLUDED.path_nodes, \
             modified_on = EXCLUDED.modified_on, exited_on = EXCLUDED.exited_on",
        );
        builder.build().execute(&mut *self.tx).await?;
        Ok(())
    }

    async fn end_session_runs(
        &mut self,
        session_uuids: &[SessionUUID],
        status: RunStatus,
        now: DateTime<Utc>,
    ) -> BackendResult<()> {
        if session_uuids.is_empty() {
            return Ok(());
        }
        self.count("update:end_session_runs", session_uuids.len());
        let uuids: Vec<Uuid> = session_uuids.iter().map(|u| u.0).collect();
        sqlx::query(
            "UPDATE flow_runs SET status = $1, exited_on = $2, modified_on = $2 \
             WHERE session_uuid = ANY($3) AND status IN ('active', 'waiting')",
        )
        .bind(codec::enum_text(&status)?)
        .bind(now)
        .bind(&uuids)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn update_contact_sessions(
        &mut self,
        updates: &[ContactSessionUpdate],
    ) -> BackendResult<()> {
        if updates.is_empty() {
            return Ok(());
        }
        let updates = last_per_key(updates, |u| u.contact_id);
        self.count("update:contact_sessions", updates.len());
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "UPDATE contacts AS c SET current_session_uuid = v.session_uuid, current_flow_id = v.flow_id FROM (",
        );
        builder.push_values(updates.iter(), |mut b, u| {
            b.push_bind(u.contact_id.0)
                .push_bind(u.session_uuid.map(|s| s.0))
                .push_bind(u.flow_id.map(|f| f.0));
        });
        builder.push(") AS v(id, session_uuid, flow_id) WHERE c.id = v.id");
        builder.build().execute(&mut *self.tx).await?;
        Ok(())
    }

    async fn update_contact_names(
        &mut self,
        updates: &[(ContactID, Option<String>)],
    ) -> BackendResult<()> {
        let rows = last_per_key(updates, |(id, _)| *id)
            .into_iter()
            .map(|(id, name)| (id.0, name))
            .collect();
        self.update_contact_column("update:contact_names", "name", rows)
            .await
    }

    async fn update_contact_languages(
        &mut self,
        updates: &[(ContactID, Option<String>)],
    ) -> BackendResult<()> {
        let rows = last_per_key(updates, |(id, _)| *id)
            .into_iter()
            .map(|(id, language)| (id.0, language))
            .collect();
        self.update_contact_column("update:contact_languages", "language", rows)
            .await
    }

    async fn update_contact_statuses(
        &mut self,
        updates: &[(ContactID, ContactStatus)],
    ) -> BackendResult<()> {
        let mut rows = Vec::with_capacity(updates.len());
        for (id, status) in last_per_key(updates, |(id, _)| *id) {
            rows.push((id.0, codec::enum_text(&status)?));
        }
        self.update_contact_column("update:contact_statuses", "status", rows)
            .await
    }

    async fn update_contact_last_seen(
        &mut self,
        updates: &[(ContactID, DateTime<Utc>)],
    ) -> BackendResult<()> {
        let rows = last_per_key(updates, |(id, _)| *id)
            .into_iter()
            .map(|(id, seen)| (id.0, seen))
            .collect();
        self.update_contact_column("update:contact_last_seen", "last_seen_on", rows)
            .await
    }

    async fn update_contact_fields(&mut self, updates: &[ContactFieldUpdate]) -> BackendResult<()> {
        if updates.is_empty() {
            return Ok(());
        }
        // fold every change for a contact into one patch and one removal list
        let mut patches: BTreeMap<ContactID, (serde_json::Map<String, serde_json::Value>, Vec<String>)> =
            BTreeMap::new();
        for update in updates {
            let (set, removed) = patches.entry(update.contact_id).or_default();
            match &update.value {
                Some(value) => {
                    removed.retain(|k| k != &update.key);
                    set.insert(update.key.clone(), serde_json::to_value(value)?);
                }
                None => {
                    set.remove(&update.key);
                    removed.push(update.key.clone());
                }
            }
        }
        self.count("update:contact_fields", patches.len());
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "UPDATE contacts AS c SET fields = (c.fields - v.removed) || v.patch, modified_on = NOW() FROM (",
        );
        builder.push_values(patches, |mut b, (id, (set, removed))| {
            b.push_bind(id.0)
                .push_bind(serde_json::Value::Object(set))
                .push_bind(removed);
        });
        builder.push(") AS v(id, patch, removed) WHERE c.id = v.id");
        builder.build().execute(&mut *self.tx).await?;
        Ok(())
    }

    async fn add_contact_groups(&mut self, memberships: &[GroupMembership]) -> BackendResult<()> {
        if memberships.is_empty() {
            return Ok(());
        }
        self.count("insert:contact_groups", memberships.len());
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new("INSERT INTO contact_groups (contact_id, group_id) ");
        builder.push_values(memberships.iter(), |mut b, m| {
            b.push_bind(m.contact_id.0).push_bind(m.group_id.0);
        });
        builder.push(" ON CONFLICT DO NOTHING");
        builder.build().execute(&mut *self.tx).await?;
        Ok(())
    }

    async fn remove_contact_groups(
        &mut self,
        memberships: &[GroupMembership],
    ) -> BackendResult<()> {
        if memberships.is_empty() {
            return Ok(());
        }
        self.count("delete:contact_groups", memberships.len());
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new("DELETE FROM contact_groups AS cg USING (");
        builder.push_values(memberships.iter(), |mut b, m| {
            b.push_bind(m.contact_id.0).push_bind(m.group_id.0);
        });
        builder.push(
            ") AS v(contact_id, group_id) WHERE cg.contact_id = v.contact_id AND cg.group_id = v.group_id",
        );
        builder.build().execute(&mut *self.tx).await?;
        Ok(())
    }

    async fn update_contact_urns(&mut self, updates: &[ContactURNsUpdate]) -> BackendResult<()> {
        for update in updates {
            let urns = last_per_key(&update.urns, |u| u.identity());
            let identities: Vec<String> = urns.iter().map(|u| u.identity()).collect();

            self.count("update:detach_contact_urns", 1);
            sqlx::query(
                "UPDATE contact_urns SET contact_id = NULL WHERE contact_id = $1 AND NOT (identity = ANY($2))",
            )
            .bind(update.contact_id.0)
            .bind(&identities)
            .execute(&mut *self.tx)
            .await?;

            if urns.is_empty() {
                continue;
            }
            self.count("upsert:contact_urns", urns.len());
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO contact_urns (org_id, contact_id, identity, scheme, path, display, priority) ",
            );
            builder.push_values(urns.iter().enumerate(), |mut b, (i, urn)| {
                b.push_bind(update.org_id.0)
                    .push_bind(update.contact_id.0)
                    .push_bind(urn.identity())
                    .push_bind(urn.scheme().to_string())
                    .push_bind(urn.path().to_string())
                    .push_bind(urn.display().map(str::to_string))
                    .push_bind(1000 - i as i32);
            });
            builder.push(
                " ON CONFLICT (org_id, identity) DO UPDATE SET contact_id = EXCLUDED.contact_id, \
                 priority = EXCLUDED.priority, display = COALESCE(EXCLUDED.display, contact_urns.display)",
            );
            builder.build().execute(&mut *self.tx).await?;
        }
        Ok(())
    }

    async fn update_contacts_modified_on(
        &mut self,
        contact_ids: &[ContactID],
        now: DateTime<Utc>,
    ) -> BackendResult<()> {
        if contact_ids.is_empty() {
            return Ok(());
        }
        self.count("update:contacts_modified_on", contact_ids.len());
        let ids: Vec<i64> = contact_ids.iter().map(|id| id.0).collect();
        sqlx::query("UPDATE contacts SET modified_on = $1 WHERE id = ANY($2)")
            .bind(now)
            .bind(&ids)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn insert_fires(&mut self, fires: &[ContactFire]) -> BackendResult<()> {
        if fires.is_empty() {
            return Ok(());
        }
        let fires = last_per_key(fires, |f| (f.contact_id, f.fire_type, f.scope.clone()));
        self.count("upsert:contact_fires", fires.len());
        let mut payloads = Vec::with_capacity(fires.len());
        for f in &fires {
            payloads.push((
                f.org_id.0,
                f.contact_id.0,
                codec::enum_text(&f.fire_type)?,
                f.scope.clone(),
                f.fire_on,
                f.session_uuid.map(|u| u.0),
                f.sprint_uuid.map(|u| u.0),
                serde_json::to_value(&f.extra)?,
            ));
        }
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO contact_fires (org_id, contact_id, fire_type, scope, fire_on, session_uuid, sprint_uuid, extra) ",
        );
        builder.push_values(
            payloads,
            |mut b, (org_id, contact_id, fire_type, scope, fire_on, session, sprint, extra)| {
                b.push_bind(org_id)
                    .push_bind(contact_id)
                    .push_bind(fire_type)
                    .push_bind(scope)
                    .push_bind(fire_on)
                    .push_bind(session)
                    .push_bind(sprint)
                    .push_bind(extra);
            },
        );
        builder.push(
            " ON CONFLICT (contact_id, fire_type, scope) DO UPDATE SET fire_on = EXCLUDED.fire_on, \
             session_uuid = EXCLUDED.session_uuid, sprint_uuid = EXCLUDED.sprint_uuid, extra = EXCLUDED.extra",
        );
        builder.build().execute(&mut *self.tx).await?;
        Ok(())
    }

    async fn delete_fires(&mut self, ids: &[FireID]) -> BackendResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.count("delete:contact_fires", ids.len());
        let ids: Vec<i64> = ids.iter().map(|id| id.0).collect();
        sqlx::query("DELETE FROM contact_fires WHERE id = ANY($1)")
            .bind(&ids)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn delete_session_fires(&mut self, contact_ids: &[ContactID]) -> BackendResult<()> {
        if contact_ids.is_empty() {
            return Ok(());
        }
        self.count("delete:session_fires", contact_ids.len());
        let ids: Vec<i64> = contact_ids.iter().map(|id| id.0).collect();
        let types = SESSION_FIRE_TYPES
            .iter()
            .map(codec::enum_text)
            .collect::<BackendResult<Vec<String>>>()?;
        sqlx::query("DELETE FROM contact_fires WHERE contact_id = ANY($1) AND fire_type = ANY($2)")
            .bind(&ids)
            .bind(&types)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn delete_campaign_fires(&mut self, keys: &[CampaignFireKey]) -> BackendResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        self.count("delete:campaign_fires", keys.len());
        let campaign = codec::enum_text(&FireType::Campaign)?;
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new("DELETE FROM contact_fires AS f USING (");
        builder.push_values(keys.iter(), |mut b, k| {
            b.push_bind(k.contact_id.0).push_bind(k.point_id.0.to_string());
        });
        builder.push(") AS v(contact_id, point_id) WHERE f.fire_type = ");
        builder.push_bind(campaign);
        builder.push(
            " AND f.contact_id = v.contact_id \
             AND split_part(regexp_replace(f.scope, '^C/', ''), ':', 1) = v.point_id",
        );
        builder.build().execute(&mut *self.tx).await?;
        Ok(())
    }

    async fn delete_point_fires(&mut self, point_id: PointID) -> BackendResult<()> {
        self.count("delete:point_fires", 1);
        sqlx::query(
            "DELETE FROM contact_fires WHERE fire_type = $1 \
             AND split_part(regexp_replace(scope, '^C/', ''), ':', 1) = $2",
        )
        .bind(codec::enum_text(&FireType::Campaign)?)
        .bind(point_id.0.to_string())
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn insert_call(&mut self, call: &Call) -> BackendResult<CallID> {
        self.count("insert:calls", 1);
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO calls (uuid, org_id, channel_id, contact_id, urn_id, direction, status, \
             external_id, duration, error_reason, error_count, next_attempt, session_uuid, trigger, \
             created_on, modified_on, started_on, ended_on) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18) \
             RETURNING id",
        )
        .bind(call.uuid.0)
        .bind(call.org_id.0)
        .bind(call.channel_id.0)
        .bind(call.contact_id.0)
        .bind(call.urn_id.0)
        .bind(codec::enum_text(&call.direction)?)
        .bind(codec::enum_text(&call.status)?)
        .bind(call.external_id.as_deref())
        .bind(call.duration)
        .bind(call.error_reason.as_ref().map(codec::enum_text).transpose()?)
        .bind(call.error_count)
        .bind(call.next_attempt)
        .bind(call.session_uuid.map(|u| u.0))
        .bind(call.trigger.clone())
        .bind(call.created_on)
        .bind(call.modified_on)
        .bind(call.started_on)
        .bind(call.ended_on)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(CallID(id))
    }

    async fn update_calls(&mut self, calls: &[Call]) -> BackendResult<()> {
        if calls.is_empty() {
            return Ok(());
        }
        let calls = last_per_key(calls, |c| c.id);
        self.count("update:calls", calls.len());
        let mut payloads = Vec::with_capacity(calls.len());
        for c in &calls {
            payloads.push((
                c.id.0,
                codec::enum_text(&c.status)?,
                c.external_id.clone(),
                c.duration,
                c.error_reason.as_ref().map(codec::enum_text).transpose()?,
                c.error_count,
                c.next_attempt,
                c.session_uuid.map(|u| u.0),
                c.modified_on,
                c.started_on,
                c.ended_on,
            ));
        }
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "UPDATE calls AS c SET status = v.status, external_id = v.external_id, duration = v.duration, \
             error_reason = v.error_reason, error_count = v.error_count, next_attempt = v.next_attempt, \
             session_uuid = v.session_uuid, modified_on = v.modified_on, started_on = v.started_on, \
             ended_on = v.ended_on FROM (",
        );
        builder.push_values(
            payloads,
            |mut b,
             (
                id,
                status,
                external_id,
                duration,
                error_reason,
                error_count,
                next_attempt,
                session,
                modified_on,
                started_on,
                ended_on,
            )| {
                b.push_bind(id)
                    .push_bind(status)
                    .push_bind(external_id)
                    .push_bind(duration)
                    .push_bind(error_reason)
                    .push_bind(error_count)
                    .push_bind(next_attempt)
                    .push_bind(session)
                    .push_bind(modified_on)
                    .push_bind(started_on)
                    .push_bind(ended_on);
            },
        );
        builder.push(
            ") AS v(id, status, external_id, duration, error_reason, error_count, next_attempt, \
             session_uuid, modified_on, started_on, ended_on) WHERE c.id = v.id",
        );
        builder.build().execute(&mut *self.tx).await?;
        Ok(())
    }

    async fn insert_msgs(&mut self, msgs: &[Msg]) -> BackendResult<Vec<MsgID>> {
        if msgs.is_empty() {
            return Ok(Vec::new());
        }
        self.count("insert:msgs", msgs.len());
        let mut payloads = Vec::with_capacity(msgs.len());
        for m in msgs {
            payloads.push((
                m,
                codec::enum_text(&m.direction)?,
                codec::enum_text(&m.status)?,
                codec::enum_text(&m.visibility)?,
                codec::enum_text(&m.msg_type)?,
            ));
        }
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO msgs (uuid, org_id, channel_id, contact_id, contact_urn_id, direction, status, \
             visibility, msg_type, text, attachments, quick_replies, locale, flow_id, ticket_id, \
             broadcast_id, optin_id, created_by_id, external_id, high_priority, error_count, \
             failed_reason, created_on, modified_on, sent_on) ",
        );
        builder.push_values(
            payloads,
            |mut b, (m, direction, status, visibility, msg_type)| {
                b.push_bind(m.uuid.0)
                    .push_bind(m.org_id.0)
                    .push_bind(m.channel_id.map(|id| id.0))
                    .push_bind(m.contact_id.0)
                    .push_bind(m.contact_urn_id.map(|id| id.0))
                    .push_bind(direction)
                    .push_bind(status)
                    .push_bind(visibility)
                    .push_bind(msg_type)
                    .push_bind(m.text.clone())
                    .push_bind(m.attachments.clone())
                    .push_bind(m.quick_replies.clone())
                    .push_bind(m.locale.clone())
                    .push_bind(m.flow_id.map(|id| id.0))
                    .push_bind(m.ticket_id.map(|id| id.0))
                    .push_bind(m.broadcast_id.map(|id| id.0))
                    .push_bind(m.optin_id.map(|id| id.0))
                    .push_bind(m.created_by_id.map(|id| id.0))
                    .push_bind(m.external_id.clone())
                    .push_bind(m.high_priority)
                    .push_bind(m.error_count)
                    .push_bind(m.failed_reason.clone())
                    .push_bind(m.created_on)
                    .push_bind(m.modified_on)
                    .push_bind(m.sent_on);
            },
        );
        builder.push(" RETURNING id, uuid");
        let rows = builder.build().fetch_all(&mut *self.tx).await?;

        let mut by_uuid: HashMap<Uuid, i64> = HashMap::with_capacity(rows.len());
        for row in &rows {
            by_uuid.insert(row.try_get("uuid")?, row.try_get("id")?);
        }
        msgs.iter()
            .map(|m| {
                by_uuid
                    .get(&m.uuid.0)
                    .map(|id| MsgID(*id))
                    .ok_or_else(|| BackendError::Message(format!("msg {} not inserted", m.uuid)))
            })
            .collect()
    }

    async fn mark_msgs_handled(&mut self, msgs: &[MsgHandled]) -> BackendResult<()> {
        if msgs.is_empty() {
            return Ok(());
        }
        let msgs = last_per_key(msgs, |m| m.msg_id);
        self.count("update:msgs_handled", msgs.len());
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "UPDATE msgs AS m SET status = 'handled', flow_id = v.flow_id, ticket_id = v.ticket_id, \
             visibility = CASE WHEN v.archive THEN 'archived' ELSE m.visibility END, \
             modified_on = NOW() FROM (",
        );
        builder.push_values(msgs.iter(), |mut b, h| {
            b.push_bind(h.msg_id.0)
                .push_bind(h.flow_id.map(|id| id.0))
                .push_bind(h.ticket_id.map(|id| id.0))
                .push_bind(h.archive);
        });
        builder.push(
            ") AS v(id, flow_id, ticket_id, archive) WHERE m.id = v.id AND m.status = 'pending'",
        );
        builder.build().execute(&mut *self.tx).await?;
        Ok(())
    }

    async fn update_msg_statuses(&mut self, updates: &[MsgStatusUpdate]) -> BackendResult<()> {
        if updates.is_empty() {
            return Ok(());
        }
        let updates = last_per_key(updates, |u| u.msg_id);
        self.count("update:msg_statuses", updates.len());
        let mut payloads = Vec::with_capacity(updates.len());
        for u in &updates {
            payloads.push((
                u.msg_id.0,
                codec::enum_text(&u.status)?,
                u.external_id.clone(),
                u.failed_reason.clone(),
                u.at,
            ));
        }
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "UPDATE msgs AS m SET status = v.status, \
             external_id = COALESCE(v.external_id, m.external_id), \
             sent_on = CASE WHEN v.status IN ('wired', 'sent') THEN COALESCE(m.sent_on, v.at) ELSE m.sent_on END, \
             error_count = m.error_count + CASE WHEN v.status = 'errored' THEN 1 ELSE 0 END, \
             failed_reason = CASE WHEN v.status = 'failed' THEN v.failed_reason ELSE m.failed_reason END, \
             modified_on = v.at FROM (",
        );
        builder.push_values(
            payloads,
            |mut b, (id, status, external_id, failed_reason, at)| {
                b.push_bind(id)
                    .push_bind(status)
                    .push_bind(external_id)
                    .push_bind(failed_reason)
                    .push_bind(at);
            },
        );
        builder.push(") AS v(id, status, external_id, failed_reason, at) WHERE m.id = v.id");
        builder.build().execute(&mut *self.tx).await?;
        Ok(())
    }

    async fn delete_msgs(&mut self, deletions: &[MsgDeletion]) -> BackendResult<()> {
        if deletions.is_empty() {
            return Ok(());
        }
        let deletions = last_per_key(deletions, |d| d.msg_uuid);
        self.count("update:msgs_deleted", deletions.len());
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "UPDATE msgs AS m SET visibility = CASE WHEN v.by_contact THEN 'deleted_by_sender' ELSE 'deleted' END, \
             text = '', attachments = '{}', modified_on = NOW() FROM (",
        );
        builder.push_values(deletions.iter(), |mut b, d| {
            b.push_bind(d.org_id.0)
                .push_bind(d.msg_uuid.0)
                .push_bind(d.by_contact);
        });
        builder.push(
            ") AS v(org_id, uuid, by_contact) WHERE m.org_id = v.org_id AND m.uuid = v.uuid \
             AND m.direction = 'in'",
        );
        builder.build().execute(&mut *self.tx).await?;
        Ok(())
    }

    async fn add_msg_labels(&mut self, labels: &[MsgLabel]) -> BackendResult<()> {
        if labels.is_empty() {
            return Ok(());
        }
        self.count("insert:msg_labels", labels.len());
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new("INSERT INTO msg_labels (msg_uuid, label_id) ");
        builder.push_values(labels.iter(), |mut b, l| {
            b.push_bind(l.msg_uuid.0).push_bind(l.label_id.0);
        });
        builder.push(" ON CONFLICT DO NOTHING");
        builder.build().execute(&mut *self.tx).await?;
        Ok(())
    }

    async fn insert_tickets(&mut self, tickets: &[Ticket]) -> BackendResult<Vec<TicketID>> {
        if tickets.is_empty() {
            return Ok(Vec::new());
        }
        self.count("insert:tickets", tickets.len());
        let mut payloads = Vec::with_capacity(tickets.len());
        for t in tickets {
            payloads.push((t, codec::enum_text(&t.status)?));
        }
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO tickets (uuid, org_id, contact_id, topic_id, assignee_id, status, \
             opened_in_flow_id, opened_by_id, opened_on, closed_on, last_activity_on, modified_on) ",
        );
        builder.push_values(payloads, |mut b, (t, status)| {
            b.push_bind(t.uuid.0)
                .push_bind(t.org_id.0)
                .push_bind(t.contact_id.0)
                .push_bind(t.topic_id.map(|id| id.0))
                .push_bind(t.assignee_id.map(|id| id.0))
                .push_bind(status)
                .push_bind(t.opened_in_flow_id.map(|id| id.0))
                .push_bind(t.opened_by_id.map(|id| id.0))
                .push_bind(t.opened_on)
                .push_bind(t.closed_on)
                .push_bind(t.last_activity_on)
                .push_bind(t.modified_on);
        });
        builder.push(" RETURNING id, uuid");
        let rows = builder.build().fetch_all(&mut *self.tx).await?;

        let mut by_uuid: HashMap<Uuid, i64> = HashMap::with_capacity(rows.len());
        for row in &rows {
            by_uuid.insert(row.try_get("uuid")?, row.try_get("id")?);
        }
        tickets
            .iter()
            .map(|t| {
                by_uuid
                    .get(&t.uuid.0)
                    .map(|id| TicketID(*id))
                    .ok_or_else(|| BackendError::Message(format!("ticket {} not inserted", t.uuid)))
            })
            .collect()
    }

    async fn update_tickets(&mut self, tickets: &[Ticket]) -> BackendResult<()> {
        if tickets.is_empty() {
            return Ok(());
        }
        let tickets = last_per_key(tickets, |t| t.id);
        self.count("update:tickets", tickets.len());
        let mut payloads = Vec::with_capacity(tickets.len());
        for t in &tickets {
            payloads.push((t, codec::enum_text(&t.status)?));
        }
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "UPDATE tickets AS t SET topic_id = v.topic_id, assignee_id = v.assignee_id, status = v.status, \
             closed_on = v.closed_on, last_activity_on = v.last_activity_on, modified_on = v.modified_on FROM (",
        );
        builder.push_values(payloads, |mut b, (t, status)| {
            b.push_bind(t.id.0)
                .push_bind(t.topic_id.map(|id| id.0))
                .push_bind(t.assignee_id.map(|id| id.0))
                .push_bind(status)
                .push_bind(t.closed_on)
                .push_bind(t.last_activity_on)
                .push_bind(t.modified_on);
        });
        builder.push(
            ") AS v(id, topic_id, assignee_id, status, closed_on, last_activity_on, modified_on) \
             WHERE t.id = v.id",
        );
        builder.build().execute(&mut *self.tx).await?;
        Ok(())
    }

    async fn insert_ticket_events(&mut self, events: &[TicketEvent]) -> BackendResult<()> {
        if events.is_empty() {
            return Ok(());
        }
        self.count("insert:ticket_events", events.len());
        let mut payloads = Vec::with_capacity(events.len());
        for e in events {
            payloads.push((e, codec::enum_text(&e.event_type)?));
        }
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO ticket_events (uuid, org_id, contact_id, ticket_id, event_type, note, topic_id, \
             assignee_id, created_by_id, created_on) ",
        );
        builder.push_values(payloads, |mut b, (e, event_type)| {
            b.push_bind(e.uuid.0)
                .push_bind(e.org_id.0)
                .push_bind(e.contact_id.0)
                .push_bind(e.ticket_id.0)
                .push_bind(event_type)
                .push_bind(e.note.clone())
                .push_bind(e.topic_id.map(|id| id.0))
                .push_bind(e.assignee_id.map(|id| id.0))
                .push_bind(e.created_by_id.map(|id| id.0))
                .push_bind(e.created_on);
        });
        builder.push(" ON CONFLICT (uuid) DO NOTHING");
        builder.build().execute(&mut *self.tx).await?;
        Ok(())
    }

    async fn update_ticket_activity(
        &mut self,
        ticket_ids: &[TicketID],
        now: DateTime<Utc>,
    ) -> BackendResult<()> {
        if ticket_ids.is_empty() {
            return Ok(());
        }
        self.count("update:ticket_activity", ticket_ids.len());
        let ids: Vec<i64> = ticket_ids.iter().map(|id| id.0).collect();
        sqlx::query("UPDATE tickets SET last_activity_on = $1 WHERE id = ANY($2)")
            .bind(now)
            .bind(&ids)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn insert_http_logs(&mut self, logs: &[HttpLog]) -> BackendResult<()> {
        if logs.is_empty() {
            return Ok(());
        }
        self.count("insert:http_logs", logs.len());
        let mut payloads = Vec::with_capacity(logs.len());
        for l in logs {
            payloads.push((l, codec::enum_text(&l.log_type)?));
        }
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO http_logs (org_id, log_type, flow_id, url, status_code, request, response, \
             is_error, elapsed_ms, retries, created_on) ",
        );
        builder.push_values(payloads, |mut b, (l, log_type)| {
            b.push_bind(l.org_id.0)
                .push_bind(log_type)
                .push_bind(l.flow_id.map(|id| id.0))
                .push_bind(l.url.clone())
                .push_bind(l.status_code)
                .push_bind(l.request.clone())
                .push_bind(l.response.clone())
                .push_bind(l.is_error)
                .push_bind(l.elapsed_ms)
                .push_bind(l.retries)
                .push_bind(l.created_on);
        });
        builder.build().execute(&mut *self.tx).await?;
        Ok(())
    }

    async fn insert_airtime_transfers(
        &mut self,
        transfers: &[AirtimeTransfer],
    ) -> BackendResult<()> {
        if transfers.is_empty() {
            return Ok(());
        }
        self.count("insert:airtime_transfers", transfers.len());
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO airtime_transfers (org_id, contact_id, external_id, status, sender, recipient, \
             currency, desired_amount, actual_amount, created_on) ",
        );
        builder.push_values(transfers.iter(), |mut b, t| {
            b.push_bind(t.org_id.0)
                .push_bind(t.contact_id.0)
                .push_bind(t.external_id.clone())
                .push_bind(t.status.clone())
                .push_bind(t.sender.clone())
                .push_bind(t.recipient.clone())
                .push_bind(t.currency.clone())
                .push_bind(t.desired_amount)
                .push_bind(t.actual_amount)
                .push_bind(t.created_on);
        });
        builder.build().execute(&mut *self.tx).await?;
        Ok(())
    }

    async fn insert_flow_activity(&mut self, counts: &[FlowActivityCount]) -> BackendResult<()> {
        if counts.is_empty() {
            return Ok(());
        }
        self.count("insert:flow_activity_counts", counts.len());
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new("INSERT INTO flow_activity_counts (flow_id, scope, count) ");
        builder.push_values(counts.iter(), |mut b, c| {
            b.push_bind(c.flow_id.0)
                .push_bind(c.scope.clone())
                .push_bind(c.count);
        });
        builder.build().execute(&mut *self.tx).await?;
        Ok(())
    }

    async fn insert_notifications(&mut self, notifications: &[Notification]) -> BackendResult<()> {
        if notifications.is_empty() {
            return Ok(());
        }
        let notifications = last_per_key(notifications, |n| {
            (n.org_id, n.notification_type.clone(), n.scope.clone(), n.user_id)
        });
        self.count("insert:notifications", notifications.len());
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO notifications (org_id, notification_type, scope, user_id, ticket_id, incident_id, created_on) ",
        );
        builder.push_values(notifications.iter(), |mut b, n| {
            b.push_bind(n.org_id.0)
                .push_bind(n.notification_type.clone())
                .push_bind(n.scope.clone())
                .push_bind(n.user_id.0)
                .push_bind(n.ticket_id.map(|id| id.0))
                .push_bind(n.incident_id.map(|id| id.0))
                .push_bind(n.created_on);
        });
        builder.push(
            " ON CONFLICT (org_id, notification_type, scope, user_id) WHERE NOT is_seen DO NOTHING",
        );
        builder.build().execute(&mut *self.tx).await?;
        Ok(())
    }

    async fn get_or_create_incident(
        &mut self,
        org_id: OrgID,
        incident_type: &str,
        scope: &str,
        now: DateTime<Utc>,
    ) -> BackendResult<(Incident, bool)> {
        self.count("insert:incidents", 1);
        let created = sqlx::query(
            "INSERT INTO incidents (org_id, incident_type, scope, started_on) VALUES ($1, $2, $3, $4) \
             ON CONFLICT (org_id, incident_type, scope) WHERE ended_on IS NULL DO NOTHING \
             RETURNING id, org_id, incident_type, scope, started_on, ended_on",
        )
        .bind(org_id.0)
        .bind(incident_type)
        .bind(scope)
        .bind(now)
        .fetch_optional(&mut *self.tx)
        .await?;
        if let Some(row) = created {
            return Ok((codec::incident(&row)?, true));
        }

        self.count("select:open_incident", 1);
        let row = sqlx::query(
            "SELECT id, org_id, incident_type, scope, started_on, ended_on FROM incidents \
             WHERE org_id = $1 AND incident_type = $2 AND scope = $3 AND ended_on IS NULL",
        )
        .bind(org_id.0)
        .bind(incident_type)
        .bind(scope)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok((codec::incident(&row)?, false))
    }

    async fn end_incident(&mut self, id: IncidentID, now: DateTime<Utc>) -> BackendResult<()> {
        self.count("update:end_incident", 1);
        sqlx::query("UPDATE incidents SET ended_on = COALESCE(ended_on, $2) WHERE id = $1")
            .bind(id.0)
            .bind(now)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn update_point_status(
        &mut self,
        point_id: PointID,
        status: PointStatus,
    ) -> BackendResult<()> {
        self.count("update:campaign_point_status", 1);
        sqlx::query("UPDATE campaign_points SET status = $2 WHERE id = $1")
            .bind(point_id.0)
            .bind(codec::enum_text(&status)?)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn update_flow_start(
        &mut self,
        id: StartID,
        status: StartStatus,
        contact_count: Option<i64>,
    ) -> BackendResult<()> {
        self.count("update:flow_start", 1);
        sqlx::query(
            "UPDATE flow_starts SET status = $2, contact_count = COALESCE($3, contact_count), \
             modified_on = NOW() WHERE id = $1",
        )
        .bind(id.0)
        .bind(codec::enum_text(&status)?)
        .bind(contact_count)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn insert_broadcast(&mut self, broadcast: &Broadcast) -> BackendResult<BroadcastID> {
        self.count("insert:broadcasts", 1);
        let contact_ids: Vec<i64> = broadcast.contact_ids.iter().map(|id| id.0).collect();
        let group_ids: Vec<i64> = broadcast.group_ids.iter().map(|id| id.0).collect();
        let urns: Vec<String> = broadcast.urns.iter().map(|u| u.to_string()).collect();
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO broadcasts (uuid, org_id, translations, base_language, optin_id, contact_ids, \
             group_ids, urns, query, exclusions, created_by_id, created_on) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) RETURNING id",
        )
        .bind(broadcast.uuid.0)
        .bind(broadcast.org_id.0)
        .bind(serde_json::to_value(&broadcast.translations)?)
        .bind(&broadcast.base_language)
        .bind(broadcast.optin_id.map(|id| id.0))
        .bind(&contact_ids)
        .bind(&group_ids)
        .bind(&urns)
        .bind(broadcast.query.as_deref())
        .bind(serde_json::to_value(&broadcast.exclusions)?)
        .bind(broadcast.created_by_id.map(|id| id.0))
        .bind(broadcast.created_on)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(BroadcastID(id))
    }

    async fn unsubscribe_resthooks(
        &mut self,
        unsubscribes: &[ResthookUnsubscribe],
    ) -> BackendResult<()> {
        if unsubscribes.is_empty() {
            return Ok(());
        }
        self.count("update:resthook_subscribers", unsubscribes.len());
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "UPDATE resthook_subscribers AS r SET is_active = FALSE FROM (",
        );
        builder.push_values(unsubscribes.iter(), |mut b, u| {
            b.push_bind(u.org_id.0)
                .push_bind(u.slug.clone())
                .push_bind(u.url.clone());
        });
        builder.push(
            ") AS v(org_id, slug, url) WHERE r.org_id = v.org_id AND r.slug = v.slug \
             AND r.target_url = v.url AND r.is_active",
        );
        builder.build().execute(&mut *self.tx).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_per_key_keeps_latest_in_first_seen_order() {
        let rows = vec![(1, "a"), (2, "b"), (1, "c")];
        assert_eq!(last_per_key(&rows, |(k, _)| *k), vec![(1, "c"), (2, "b")]);
    }
}
