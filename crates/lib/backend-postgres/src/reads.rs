use std::collections::HashMap;

use chrono::{DateTime, Utc};
use mailroom_core_backend::{BackendError, BackendResult, CoreBackend, CoreTx};
use mailroom_models::{
    Broadcast, BroadcastID, Call, CallID, Campaign, CampaignPoint, Channel, ChannelID, ChannelUUID, Contact,
    ContactFire, ContactUUID, ContactID, Field, FireType, Flow, FlowID, FlowStart, Group, GroupID, Incident, LLM, Label,
    Msg, MsgID, OptIn, Org, OrgID, PointID, Session, SessionUUID, StartID, Ticket, TicketID, Topic,
    Trigger, URN, User,
};
use mailroom_observability_macros::obs;
use sqlx::Row;
use sqlx::postgres::PgRow;

use crate::PostgresBackend;
use crate::codec;

const CONTACT_COLUMNS: &str = "id, uuid, org_id, name, language, status, timezone, fields, \
    current_session_uuid, current_flow_id, created_on, modified_on, last_seen_on";
const URN_COLUMNS: &str =
    "id, contact_id, identity, scheme, path, display, priority, channel_id, auth_tokens";
const SESSION_COLUMNS: &str = "uuid, org_id, contact_id, session_type, status, current_flow_uuid, \
    last_sprint_uuid, output, call_id, created_on, ended_on";
const MSG_COLUMNS: &str = "id, uuid, org_id, channel_id, contact_id, contact_urn_id, direction, \
    status, visibility, msg_type, text, attachments, quick_replies, locale, flow_id, ticket_id, \
    broadcast_id, optin_id, created_by_id, external_id, high_priority, error_count, failed_reason, \
    created_on, modified_on, sent_on";
const TICKET_COLUMNS: &str = "id, uuid, org_id, contact_id, topic_id, assignee_id, status, \
    opened_in_flow_id, opened_by_id, opened_on, closed_on, last_activity_on, modified_on";
const FIRE_COLUMNS: &str =
    "id, org_id, contact_id, fire_type, scope, fire_on, session_uuid, sprint_uuid, extra";
const CALL_COLUMNS: &str = "id, uuid, org_id, channel_id, contact_id, urn_id, direction, status, \
    external_id, duration, error_reason, error_count, next_attempt, session_uuid, trigger, \
    created_on, modified_on, started_on, ended_on";
const POINT_COLUMNS: &str = "p.id, p.uuid, p.campaign_id, p.relative_to, p.\"offset\", p.unit, \
    p.delivery_hour, p.action, p.start_mode, p.status, p.fire_version";

fn decode_all<T>(
    rows: Vec<PgRow>,
    decode: fn(&PgRow) -> BackendResult<T>,
) -> BackendResult<Vec<T>> {
    rows.iter().map(decode).collect()
}

impl PostgresBackend {
    async fn load_org_rows<T>(
        &self,
        label: &str,
        sql: &str,
        org_id: OrgID,
        decode: fn(&PgRow) -> BackendResult<T>,
    ) -> BackendResult<Vec<T>> {
        Self::count_query(&self.query_counts, label);
        let rows = sqlx::query(sql)
            .bind(org_id.0)
            .fetch_all(self.reader())
            .await?;
        decode_all(rows, decode)
    }

    /// Contacts with their URNs, groups and open tickets.
    #[obs]
    async fn load_full_contacts(
        &self,
        org_id: OrgID,
        ids: &[ContactID],
    ) -> BackendResult<Vec<Contact>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<i64> = ids.iter().map(|id| id.0).collect();
        let reader = self.reader();

        Self::count_query(&self.query_counts, "select:contacts");
        Self::count_batch_size(&self.batch_size_counts, "select:contacts", ids.len());
        let rows = sqlx::query(&format!(
            "SELECT {CONTACT_COLUMNS} FROM contacts WHERE org_id = $1 AND id = ANY($2) AND is_active ORDER BY id"
        ))
        .bind(org_id.0)
        .bind(&ids)
        .fetch_all(reader)
        .await?;
        let mut contacts = decode_all(rows, codec::contact)?;

        Self::count_query(&self.query_counts, "select:contact_urns");
        let urn_rows = sqlx::query(&format!(
            "SELECT {URN_COLUMNS} FROM contact_urns WHERE contact_id = ANY($1) ORDER BY priority DESC, id"
        ))
        .bind(&ids)
        .fetch_all(reader)
        .await?;

        Self::count_query(&self.query_counts, "select:contact_groups");
        let group_rows =
            sqlx::query("SELECT contact_id, group_id FROM contact_groups WHERE contact_id = ANY($1)")
                .bind(&ids)
                .fetch_all(reader)
                .await?;

        Self::count_query(&self.query_counts, "select:open_tickets");
        let ticket_rows = sqlx::query(
            "SELECT id, contact_id FROM tickets WHERE contact_id = ANY($1) AND status = 'open' ORDER BY id",
        )
        .bind(&ids)
        .fetch_all(reader)
        .await?;

        let index: HashMap<ContactID, usize> = contacts
            .iter()
            .enumerate()
            .map(|(i, c)| (c.id, i))
            .collect();
        for row in &urn_rows {
            let urn = codec::contact_urn(row)?;
            if let Some(&i) = urn.contact_id.and_then(|id| index.get(&id)) {
                contacts[i].urns.push(urn);
            }
        }
        for row in &group_rows {
            let contact_id = ContactID(row.try_get("contact_id")?);
            if let Some(&i) = index.get(&contact_id) {
                contacts[i].group_ids.push(GroupID(row.try_get("group_id")?));
            }
        }
        for row in &ticket_rows {
            let contact_id = ContactID(row.try_get("contact_id")?);
            if let Some(&i) = index.get(&contact_id) {
                contacts[i].open_ticket_ids.push(TicketID(row.try_get("id")?));
            }
        }
        Ok(contacts)
    }

    #[obs]
    async fn load_campaigns_with_points(&self, org_id: OrgID) -> BackendResult<Vec<Campaign>> {
        let mut campaigns = self
            .load_org_rows(
                "select:campaigns",
                "SELECT id, uuid, name, group_id FROM campaigns WHERE org_id = $1 AND NOT is_archived ORDER BY id",
                org_id,
                codec::campaign,
            )
            .await?;
        Self::count_query(&self.query_counts, "select:campaign_points");
        let rows = sqlx::query(&format!(
            "SELECT {POINT_COLUMNS} FROM campaign_points p JOIN campaigns c ON c.id = p.campaign_id \
             WHERE c.org_id = $1 AND NOT c.is_archived AND p.is_active ORDER BY p.id"
        ))
        .bind(org_id.0)
        .fetch_all(self.reader())
        .await?;
        for row in &rows {
            let point = codec::campaign_point(row)?;
            if let Some(campaign) = campaigns.iter_mut().find(|c| c.id == point.campaign_id) {
                campaign.points.push(point);
            }
        }
        Ok(campaigns)
    }
}

#[async_trait::async_trait]
impl CoreBackend for PostgresBackend {
    fn clone_box(&self) -> Box<dyn CoreBackend> {
        Box::new(self.clone())
    }

    async fn begin(&self) -> BackendResult<Box<dyn CoreTx>> {
        Ok(Box::new(self.begin_tx().await?))
    }

    async fn load_org(&self, org_id: OrgID) -> BackendResult<Org> {
        Self::count_query(&self.query_counts, "select:org");
        let row = sqlx::query(
            "SELECT id, uuid, name, timezone, language, is_active, is_suspended FROM orgs WHERE id = $1 AND is_active",
        )
        .bind(org_id.0)
        .fetch_optional(self.reader())
        .await?
        .ok_or_else(|| BackendError::NotFound(format!("org {org_id}")))?;
        codec::org(&row)
    }

    async fn load_flows(&self, org_id: OrgID) -> BackendResult<Vec<Flow>> {
        self.load_org_rows(
            "select:flows",
            "SELECT id, uuid, org_id, name, flow_type, definition, ignore_triggers, ivr_retry_minutes, is_active \
             FROM flows WHERE org_id = $1 AND is_active AND NOT is_archived ORDER BY id",
            org_id,
            codec::flow,
        )
        .await
    }

    async fn load_fields(&self, org_id: OrgID) -> BackendResult<Vec<Field>> {
        self.load_org_rows(
            "select:fields",
            "SELECT id, uuid, key, name, value_type, is_system FROM fields WHERE org_id = $1 AND is_active ORDER BY id",
            org_id,
            codec::field,
        )
        .await
    }

    async fn load_groups(&self, org_id: OrgID) -> BackendResult<Vec<Group>> {
        self.load_org_rows(
            "select:groups",
            "SELECT id, uuid, name, group_type, query FROM groups WHERE org_id = $1 AND is_active ORDER BY id",
            org_id,
            codec::group,
        )
        .await
    }

    async fn load_channels(&self, org_id: OrgID) -> BackendResult<Vec<Channel>> {
        self.load_org_rows(
            "select:channels",
            "SELECT id, uuid, org_id, name, channel_type, address, schemes, roles, config, features \
             FROM channels WHERE org_id = $1 AND is_active ORDER BY id",
            org_id,
            codec::channel,
        )
        .await
    }

    async fn load_channel_by_uuid(&self, uuid: ChannelUUID) -> BackendResult<Option<Channel>> {
        Self::count_query(&self.query_counts, "select:channel_by_uuid");
        let row = sqlx::query(
            "SELECT id, uuid, org_id, name, channel_type, address, schemes, roles, config, features \
             FROM channels WHERE uuid = $1 AND is_active",
        )
        .bind(uuid.0)
        .fetch_optional(self.reader())
        .await?;
        row.as_ref().map(codec::channel).transpose()
    }

    async fn load_topics(&self, org_id: OrgID) -> BackendResult<Vec<Topic>> {
        self.load_org_rows(
            "select:topics",
            "SELECT id, uuid, name, is_default FROM topics WHERE org_id = $1 AND is_active ORDER BY id",
            org_id,
            codec::topic,
        )
        .await
    }

    async fn load_users(&self, org_id: OrgID) -> BackendResult<Vec<User>> {
        self.load_org_rows(
            "select:users",
            "SELECT id, uuid, email, name FROM users WHERE org_id = $1 AND is_active ORDER BY id",
            org_id,
            codec::user,
        )
        .await
    }

    async fn load_campaigns(&self, org_id: OrgID) -> BackendResult<Vec<Campaign>> {
        self.load_campaigns_with_points(org_id).await
    }

    async fn load_triggers(&self, org_id: OrgID) -> BackendResult<Vec<Trigger>> {
        self.load_org_rows(
            "select:triggers",
            "SELECT id, org_id, trigger_type, flow_id, keywords, match_type, channel_id, referrer_id, \
             include_group_ids, exclude_group_ids FROM triggers WHERE org_id = $1 AND NOT is_archived ORDER BY id",
            org_id,
            codec::trigger,
        )
        .await
    }

    async fn load_labels(&self, org_id: OrgID) -> BackendResult<Vec<Label>> {
        self.load_org_rows(
            "select:labels",
            "SELECT id, uuid, name FROM labels WHERE org_id = $1 AND is_active ORDER BY id",
            org_id,
            codec::label,
        )
        .await
    }

    async fn load_optins(&self, org_id: OrgID) -> BackendResult<Vec<OptIn>> {
        self.load_org_rows(
            "select:optins",
            "SELECT id, uuid, name FROM optins WHERE org_id = $1 AND is_active ORDER BY id",
            org_id,
            codec::optin,
        )
        .await
    }

    async fn load_llms(&self, org_id: OrgID) -> BackendResult<Vec<LLM>> {
        self.load_org_rows(
            "select:llms",
            "SELECT id, uuid, name, llm_type FROM llms WHERE org_id = $1 AND is_active ORDER BY id",
            org_id,
            codec::llm,
        )
        .await
    }

    async fn load_contacts(&self, org_id: OrgID, ids: &[ContactID]) -> BackendResult<Vec<Contact>> {
        self.load_full_contacts(org_id, ids).await
    }

    async fn load_group_contact_ids(
        &self,
        org_id: OrgID,
        group_id: GroupID,
    ) -> BackendResult<Vec<ContactID>> {
        Self::count_query(&self.query_counts, "select:group_contacts");
        let ids: Vec<i64> = sqlx::query_scalar(
            "SELECT cg.contact_id FROM contact_groups cg JOIN contacts c ON c.id = cg.contact_id \
             WHERE c.org_id = $1 AND cg.group_id = $2 AND c.is_active ORDER BY cg.contact_id",
        )
        .bind(org_id.0)
        .bind(group_id.0)
        .fetch_all(self.reader())
        .await?;
        Ok(ids.into_iter().map(ContactID).collect())
    }

    async fn load_contact_ids_by_urns(
        &self,
        org_id: OrgID,
        urns: &[URN],
    ) -> BackendResult<Vec<ContactID>> {
        if urns.is_empty() {
            return Ok(Vec::new());
        }
        let identities: Vec<String> = urns.iter().map(URN::identity).collect();
        Self::count_query(&self.query_counts, "select:contacts_by_urn");
        let ids: Vec<i64> = sqlx::query_scalar(
            "SELECT DISTINCT contact_id FROM contact_urns \
             WHERE org_id = $1 AND identity = ANY($2) AND contact_id IS NOT NULL",
        )
        .bind(org_id.0)
        .bind(&identities)
        .fetch_all(self.reader())
        .await?;
        Ok(ids.into_iter().map(ContactID).collect())
    }

    async fn load_contact_ids_by_uuids(
        &self,
        org_id: OrgID,
        uuids: &[ContactUUID],
    ) -> BackendResult<Vec<ContactID>> {
        if uuids.is_empty() {
            return Ok(Vec::new());
        }
        let uuids: Vec<uuid::Uuid> = uuids.iter().map(|u| u.0).collect();
        Self::count_query(&self.query_counts, "select:contacts_by_uuid");
        let ids: Vec<i64> = sqlx::query_scalar(
            "SELECT id FROM contacts WHERE org_id = $1 AND uuid = ANY($2) AND is_active",
        )
        .bind(org_id.0)
        .bind(&uuids)
        .fetch_all(self.reader())
        .await?;
        Ok(ids.into_iter().map(ContactID).collect())
    }

    async fn load_active_contact_ids(&self, org_id: OrgID) -> BackendResult<Vec<ContactID>> {
        Self::count_query(&self.query_counts, "select:active_contacts");
        let ids: Vec<i64> = sqlx::query_scalar(
            "SELECT id FROM contacts WHERE org_id = $1 AND is_active AND status = 'active' ORDER BY id",
        )
        .bind(org_id.0)
        .fetch_all(self.reader())
        .await?;
        Ok(ids.into_iter().map(ContactID).collect())
    }

    async fn load_flow_contact_ids(
        &self,
        org_id: OrgID,
        flow_id: FlowID,
    ) -> BackendResult<Vec<ContactID>> {
        Self::count_query(&self.query_counts, "select:flow_contacts");
        let ids: Vec<i64> = sqlx::query_scalar(
            "SELECT DISTINCT contact_id FROM flow_runs WHERE org_id = $1 AND flow_id = $2 ORDER BY contact_id",
        )
        .bind(org_id.0)
        .bind(flow_id.0)
        .fetch_all(self.reader())
        .await?;
        Ok(ids.into_iter().map(ContactID).collect())
    }

    async fn load_session(
        &self,
        org_id: OrgID,
        uuid: SessionUUID,
    ) -> BackendResult<Option<Session>> {
        Self::count_query(&self.query_counts, "select:session");
        let row = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM flow_sessions WHERE org_id = $1 AND uuid = $2"
        ))
        .bind(org_id.0)
        .bind(uuid.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(codec::session).transpose()
    }

    async fn load_msg(&self, org_id: OrgID, id: MsgID) -> BackendResult<Option<Msg>> {
        Self::count_query(&self.query_counts, "select:msg");
        let row = sqlx::query(&format!(
            "SELECT {MSG_COLUMNS} FROM msgs WHERE org_id = $1 AND id = $2"
        ))
        .bind(org_id.0)
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(codec::msg).transpose()
    }

    async fn load_tickets(&self, org_id: OrgID, ids: &[TicketID]) -> BackendResult<Vec<Ticket>> {
        let ids: Vec<i64> = ids.iter().map(|id| id.0).collect();
        Self::count_query(&self.query_counts, "select:tickets");
        let rows = sqlx::query(&format!(
            "SELECT {TICKET_COLUMNS} FROM tickets WHERE org_id = $1 AND id = ANY($2) ORDER BY id"
        ))
        .bind(org_id.0)
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;
        decode_all(rows, codec::ticket)
    }

    async fn load_open_tickets(
        &self,
        org_id: OrgID,
        contact_ids: &[ContactID],
    ) -> BackendResult<Vec<Ticket>> {
        let ids: Vec<i64> = contact_ids.iter().map(|id| id.0).collect();
        Self::count_query(&self.query_counts, "select:open_tickets");
        let rows = sqlx::query(&format!(
            "SELECT {TICKET_COLUMNS} FROM tickets \
             WHERE org_id = $1 AND contact_id = ANY($2) AND status = 'open' ORDER BY id"
        ))
        .bind(org_id.0)
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;
        decode_all(rows, codec::ticket)
    }

    async fn load_due_fires(
        &self,
        fire_types: &[FireType],
        now: DateTime<Utc>,
        limit: usize,
    ) -> BackendResult<Vec<ContactFire>> {
        let types = fire_types
            .iter()
            .map(codec::enum_text)
            .collect::<BackendResult<Vec<String>>>()?;
        Self::count_query(&self.query_counts, "select:due_fires");
        let rows = sqlx::query(&format!(
            "SELECT {FIRE_COLUMNS} FROM contact_fires \
             WHERE fire_type = ANY($1) AND fire_on <= $2 ORDER BY fire_on, id LIMIT $3"
        ))
        .bind(&types)
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        decode_all(rows, codec::fire)
    }

    async fn load_campaign_point(
        &self,
        org_id: OrgID,
        point_id: PointID,
    ) -> BackendResult<Option<CampaignPoint>> {
        Self::count_query(&self.query_counts, "select:campaign_point");
        let row = sqlx::query(&format!(
            "SELECT {POINT_COLUMNS} FROM campaign_points p JOIN campaigns c ON c.id = p.campaign_id \
             WHERE c.org_id = $1 AND p.id = $2 AND p.is_active"
        ))
        .bind(org_id.0)
        .bind(point_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(codec::campaign_point).transpose()
    }

    async fn load_call(&self, org_id: OrgID, id: CallID) -> BackendResult<Option<Call>> {
        Self::count_query(&self.query_counts, "select:call");
        let row = sqlx::query(&format!(
            "SELECT {CALL_COLUMNS} FROM calls WHERE org_id = $1 AND id = $2"
        ))
        .bind(org_id.0)
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(codec::call).transpose()
    }

    async fn load_call_by_external_id(
        &self,
        channel_id: ChannelID,
        external_id: &str,
    ) -> BackendResult<Option<Call>> {
        Self::count_query(&self.query_counts, "select:call_by_external_id");
        let row = sqlx::query(&format!(
            "SELECT {CALL_COLUMNS} FROM calls WHERE channel_id = $1 AND external_id = $2 \
             ORDER BY id DESC LIMIT 1"
        ))
        .bind(channel_id.0)
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(codec::call).transpose()
    }

    async fn count_active_calls(&self, channel_id: ChannelID) -> BackendResult<i64> {
        Self::count_query(&self.query_counts, "select:active_calls");
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM calls WHERE channel_id = $1 AND status IN ('wired', 'in_progress')",
        )
        .bind(channel_id.0)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn load_calls_to_retry(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> BackendResult<Vec<Call>> {
        Self::count_query(&self.query_counts, "select:calls_to_retry");
        let rows = sqlx::query(&format!(
            "SELECT {CALL_COLUMNS} FROM calls WHERE status = 'errored' AND direction = 'outgoing' \
             AND next_attempt <= $1 ORDER BY next_attempt LIMIT $2"
        ))
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        decode_all(rows, codec::call)
    }

    async fn load_throttled_calls(&self, limit: usize) -> BackendResult<Vec<Call>> {
        Self::count_query(&self.query_counts, "select:throttled_calls");
        let rows = sqlx::query(&format!(
            "SELECT {CALL_COLUMNS} FROM calls WHERE status = 'throttled' ORDER BY modified_on LIMIT $1"
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        decode_all(rows, codec::call)
    }

    async fn load_flow_start(
        &self,
        org_id: OrgID,
        id: StartID,
    ) -> BackendResult<Option<FlowStart>> {
        Self::count_query(&self.query_counts, "select:flow_start");
        let row = sqlx::query(
            "SELECT id, uuid, org_id, flow_id, start_type, status, exclusions, contact_ids, group_ids, \
             urns, query, created_by_id, params, parent_summary, session_history, contact_count, \
             created_on, modified_on FROM flow_starts WHERE org_id = $1 AND id = $2",
        )
        .bind(org_id.0)
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(codec::flow_start).transpose()
    }

    async fn load_broadcast(
        &self,
        org_id: OrgID,
        id: BroadcastID,
    ) -> BackendResult<Option<Broadcast>> {
        Self::count_query(&self.query_counts, "select:broadcast");
        let row = sqlx::query(
            "SELECT id, uuid, org_id, translations, base_language, optin_id, contact_ids, group_ids, \
             urns, query, exclusions, created_by_id, created_on FROM broadcasts WHERE org_id = $1 AND id = $2",
        )
        .bind(org_id.0)
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(codec::broadcast).transpose()
    }

    async fn load_open_incidents(&self, incident_type: &str) -> BackendResult<Vec<Incident>> {
        Self::count_query(&self.query_counts, "select:open_incidents");
        let rows = sqlx::query(
            "SELECT id, org_id, incident_type, scope, started_on, ended_on FROM incidents \
             WHERE incident_type = $1 AND ended_on IS NULL ORDER BY id",
        )
        .bind(incident_type)
        .fetch_all(&self.pool)
        .await?;
        decode_all(rows, codec::incident)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use mailroom_core_backend::{ContactURNsUpdate, GroupMembership, MsgHandled};
    use mailroom_models::{
        ContactUUID, MsgDirection, MsgStatus, MsgType, MsgUUID, MsgVisibility, OrgUUID,
    };
    use serial_test::serial;
    use sqlx::PgPool;

    use super::*;
    use crate::test_helpers::setup_backend;

    async fn seed_org(pool: &PgPool) -> OrgID {
        let org_id: i64 = sqlx::query_scalar(
            "INSERT INTO orgs (uuid, name, timezone) VALUES ($1, 'Nyaruka', 'Africa/Kigali') RETURNING id",
        )
        .bind(OrgUUID::new().0)
        .fetch_one(pool)
        .await
        .expect("insert org");
        sqlx::query("INSERT INTO groups (uuid, org_id, name, group_type) VALUES ($1, $2, 'Testers', 'manual')")
            .bind(uuid::Uuid::new_v4())
            .bind(org_id)
            .execute(pool)
            .await
            .expect("insert group");
        OrgID(org_id)
    }

    async fn seed_contact(pool: &PgPool, org_id: OrgID, name: &str) -> ContactID {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO contacts (uuid, org_id, name) VALUES ($1, $2, $3) RETURNING id",
        )
        .bind(ContactUUID::new().0)
        .bind(org_id.0)
        .bind(name)
        .fetch_one(pool)
        .await
        .expect("insert contact");
        ContactID(id)
    }

    fn incoming(org_id: OrgID, contact_id: ContactID, text: &str) -> Msg {
        let now = Utc::now();
        Msg {
            id: MsgID(0),
            uuid: MsgUUID::new(),
            org_id,
            channel_id: None,
            contact_id,
            contact_urn_id: None,
            direction: MsgDirection::In,
            status: MsgStatus::Pending,
            visibility: MsgVisibility::Visible,
            msg_type: MsgType::Text,
            text: text.to_string(),
            attachments: vec![],
            quick_replies: vec![],
            locale: None,
            flow_id: None,
            ticket_id: None,
            broadcast_id: None,
            optin_id: None,
            created_by_id: None,
            external_id: None,
            high_priority: false,
            error_count: 0,
            failed_reason: None,
            created_on: now,
            modified_on: now,
            sent_on: None,
        }
    }

    #[serial(postgres)]
    #[tokio::test]
    #[ignore = "requires postgres"]
    async fn load_org_rejects_missing_org() {
        let backend = setup_backend().await;
        let err = backend.load_org(OrgID(12345)).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[serial(postgres)]
    #[tokio::test]
    #[ignore = "requires postgres"]
    async fn committed_contact_writes_are_visible() {
        let backend = setup_backend().await;
        let org_id = seed_org(backend.pool()).await;
        let ann = seed_contact(backend.pool(), org_id, "Ann").await;
        let groups = backend.load_groups(org_id).await.expect("groups");

        let mut tx = backend.begin().await.expect("begin");
        tx.update_contact_names(&[(ann, Some("Annie".to_string()))])
            .await
            .expect("names");
        tx.add_contact_groups(&[GroupMembership {
            contact_id: ann,
            group_id: groups[0].id,
        }])
        .await
        .expect("groups");
        tx.update_contact_urns(&[ContactURNsUpdate {
            org_id,
            contact_id: ann,
            urns: vec![
                URN::parse("tel:+250788000001").unwrap(),
                URN::parse("telegram:1234").unwrap(),
            ],
        }])
        .await
        .expect("urns");
        tx.commit().await.expect("commit");

        let contacts = backend.load_contacts(org_id, &[ann]).await.expect("load");
        assert_eq!(contacts.len(), 1);
        let contact = &contacts[0];
        assert_eq!(contact.name.as_deref(), Some("Annie"));
        assert_eq!(contact.group_ids, vec![groups[0].id]);
        assert_eq!(contact.urns.len(), 2);
        assert_eq!(contact.urns[0].urn.scheme(), "tel");
        assert!(contact.urns[0].priority > contact.urns[1].priority);
        assert!(backend.query_counts().contains_key("upsert:contact_urns"));
    }

    #[serial(postgres)]
    #[tokio::test]
    #[ignore = "requires postgres"]
    async fn dropped_tx_rolls_back() {
        let backend = setup_backend().await;
        let org_id = seed_org(backend.pool()).await;
        let ann = seed_contact(backend.pool(), org_id, "Ann").await;
        {
            let mut tx = backend.begin().await.expect("begin");
            tx.update_contact_names(&[(ann, Some("Bob".to_string()))])
                .await
                .expect("names");
        }
        let contacts = backend.load_contacts(org_id, &[ann]).await.expect("load");
        assert_eq!(contacts[0].name.as_deref(), Some("Ann"));
    }

    #[serial(postgres)]
    #[tokio::test]
    #[ignore = "requires postgres"]
    async fn handled_only_touches_pending_msgs() {
        let backend = setup_backend().await;
        let org_id = seed_org(backend.pool()).await;
        let ann = seed_contact(backend.pool(), org_id, "Ann").await;

        let mut tx = backend.begin().await.expect("begin");
        let ids = tx
            .insert_msgs(&[incoming(org_id, ann, "hi"), incoming(org_id, ann, "there")])
            .await
            .expect("insert");
        tx.commit().await.expect("commit");
        assert_eq!(ids.len(), 2);

        for archive in [true, false] {
            let mut tx = backend.begin().await.expect("begin");
            tx.mark_msgs_handled(&[MsgHandled {
                msg_id: ids[0],
                flow_id: None,
                ticket_id: None,
                archive,
            }])
            .await
            .expect("handled");
            tx.commit().await.expect("commit");
        }

        let msg = backend.load_msg(org_id, ids[0]).await.expect("load").unwrap();
        assert_eq!(msg.status, MsgStatus::Handled);
        assert_eq!(msg.visibility, MsgVisibility::Archived);
        let other = backend.load_msg(org_id, ids[1]).await.expect("load").unwrap();
        assert_eq!(other.status, MsgStatus::Pending);
    }

    #[serial(postgres)]
    #[tokio::test]
    #[ignore = "requires postgres"]
    async fn incidents_are_created_once() {
        let backend = setup_backend().await;
        let org_id = seed_org(backend.pool()).await;
        let now = Utc::now();

        let mut tx = backend.begin().await.expect("begin");
        let (first, created) = tx
            .get_or_create_incident(org_id, "webhooks:unhealthy", "", now)
            .await
            .expect("create");
        assert!(created);
        let (second, created) = tx
            .get_or_create_incident(org_id, "webhooks:unhealthy", "", now)
            .await
            .expect("get");
        assert!(!created);
        assert_eq!(first.id, second.id);
        tx.commit().await.expect("commit");

        let open = backend
            .load_open_incidents("webhooks:unhealthy")
            .await
            .expect("open");
        assert_eq!(open.len(), 1);
    }
}
