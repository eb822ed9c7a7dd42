//! Row decoding and enum text encoding.
//!
//! Enum columns hold the snake_case serde name of the variant, so the same
//! encoding serves every model enum without per-type tables.

use std::collections::BTreeMap;

use mailroom_core_backend::{BackendError, BackendResult};
use mailroom_models::{
    Broadcast, BroadcastID, BroadcastUUID, Call, CallID, CallUUID, Campaign, CampaignID,
    CampaignPoint, CampaignUUID, Channel, ChannelID, ChannelRole, ChannelUUID, Contact, ContactFire,
    ContactID, ContactURN, ContactUUID, Field, FieldID, FieldUUID, FireID, Flow, FlowID, FlowStart,
    FlowUUID, Group, GroupID, GroupUUID, Incident, IncidentID, LLM, Label, LabelID, LabelUUID, Msg,
    MsgID, MsgUUID, OptIn, OptInID, OptInUUID, Org, OrgID, OrgUUID, PointID, PointUUID, Session,
    SessionUUID, SprintUUID, StartID, StartUUID, Ticket, TicketID, TicketUUID, Topic, TopicID,
    TopicUUID, Trigger, TriggerID, URN, URNID, User, UserID, UserUUID,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::Row;
use sqlx::postgres::PgRow;
use uuid::Uuid;

/// Text form of a model enum.
pub(crate) fn enum_text<T: Serialize>(value: &T) -> BackendResult<String> {
    match serde_json::to_value(value)? {
        serde_json::Value::String(s) => Ok(s),
        other => Err(BackendError::Message(format!(
            "enum encoded as non-string {other}"
        ))),
    }
}

pub(crate) fn parse_enum<T: DeserializeOwned>(raw: String) -> BackendResult<T> {
    Ok(serde_json::from_value(serde_json::Value::String(raw))?)
}

fn get_enum<T: DeserializeOwned>(row: &PgRow, column: &str) -> BackendResult<T> {
    parse_enum(row.try_get::<String, _>(column)?)
}

fn get_opt_enum<T: DeserializeOwned>(row: &PgRow, column: &str) -> BackendResult<Option<T>> {
    row.try_get::<Option<String>, _>(column)?
        .map(parse_enum)
        .transpose()
}

fn get_json<T: DeserializeOwned>(row: &PgRow, column: &str) -> BackendResult<T> {
    let value: serde_json::Value = row.try_get(column)?;
    Ok(serde_json::from_value(value)?)
}

fn get_ids<T: From<i64>>(row: &PgRow, column: &str) -> BackendResult<Vec<T>> {
    Ok(row
        .try_get::<Vec<i64>, _>(column)?
        .into_iter()
        .map(T::from)
        .collect())
}

fn get_opt_id<T: From<i64>>(row: &PgRow, column: &str) -> BackendResult<Option<T>> {
    Ok(row.try_get::<Option<i64>, _>(column)?.map(T::from))
}

fn get_urns(row: &PgRow, column: &str) -> BackendResult<Vec<URN>> {
    row.try_get::<Vec<String>, _>(column)?
        .iter()
        .map(|raw| URN::parse(raw).map_err(|err| BackendError::Message(err.to_string())))
        .collect()
}

pub(crate) fn org(row: &PgRow) -> BackendResult<Org> {
    Ok(Org {
        id: OrgID(row.try_get("id")?),
        uuid: OrgUUID(row.try_get("uuid")?),
        name: row.try_get("name")?,
        timezone: row.try_get("timezone")?,
        language: row.try_get("language")?,
        is_active: row.try_get("is_active")?,
        is_suspended: row.try_get("is_suspended")?,
    })
}

pub(crate) fn flow(row: &PgRow) -> BackendResult<Flow> {
    Ok(Flow {
        id: FlowID(row.try_get("id")?),
        uuid: FlowUUID(row.try_get("uuid")?),
        org_id: OrgID(row.try_get("org_id")?),
        name: row.try_get("name")?,
        flow_type: get_enum(row, "flow_type")?,
        definition: row.try_get("definition")?,
        ignore_triggers: row.try_get("ignore_triggers")?,
        ivr_retry_minutes: row.try_get("ivr_retry_minutes")?,
        is_active: row.try_get("is_active")?,
    })
}

pub(crate) fn field(row: &PgRow) -> BackendResult<Field> {
    Ok(Field {
        id: FieldID(row.try_get("id")?),
        uuid: FieldUUID(row.try_get("uuid")?),
        key: row.try_get("key")?,
        name: row.try_get("name")?,
        value_type: get_enum(row, "value_type")?,
        is_system: row.try_get("is_system")?,
    })
}

pub(crate) fn group(row: &PgRow) -> BackendResult<Group> {
    Ok(Group {
        id: GroupID(row.try_get("id")?),
        uuid: GroupUUID(row.try_get("uuid")?),
        name: row.try_get("name")?,
        group_type: get_enum(row, "group_type")?,
        query: row.try_get("query")?,
    })
}

pub(crate) fn channel(row: &PgRow) -> BackendResult<Channel> {
    let roles: String = row.try_get("roles")?;
    Ok(Channel {
        id: ChannelID(row.try_get("id")?),
        uuid: ChannelUUID(row.try_get("uuid")?),
        org_id: OrgID(row.try_get("org_id")?),
        name: row.try_get("name")?,
        channel_type: row.try_get("channel_type")?,
        address: row.try_get("address")?,
        schemes: row.try_get("schemes")?,
        roles: ChannelRole::parse_codes(&roles),
        config: get_json(row, "config")?,
        features: row.try_get("features")?,
    })
}

pub(crate) fn topic(row: &PgRow) -> BackendResult<Topic> {
    Ok(Topic {
        id: TopicID(row.try_get("id")?),
        uuid: TopicUUID(row.try_get("uuid")?),
        name: row.try_get("name")?,
        is_default: row.try_get("is_default")?,
    })
}

pub(crate) fn user(row: &PgRow) -> BackendResult<User> {
    Ok(User {
        id: UserID(row.try_get("id")?),
        uuid: UserUUID(row.try_get("uuid")?),
        email: row.try_get("email")?,
        name: row.try_get("name")?,
    })
}

pub(crate) fn label(row: &PgRow) -> BackendResult<Label> {
    Ok(Label {
        id: LabelID(row.try_get("id")?),
        uuid: LabelUUID(row.try_get("uuid")?),
        name: row.try_get("name")?,
    })
}

pub(crate) fn optin(row: &PgRow) -> BackendResult<OptIn> {
    Ok(OptIn {
        id: OptInID(row.try_get("id")?),
        uuid: OptInUUID(row.try_get("uuid")?),
        name: row.try_get("name")?,
    })
}

pub(crate) fn llm(row: &PgRow) -> BackendResult<LLM> {
    Ok(LLM {
        id: row.try_get("id")?,
        uuid: row.try_get("uuid")?,
        name: row.try_get("name")?,
        llm_type: row.try_get("llm_type")?,
    })
}

pub(crate) fn campaign(row: &PgRow) -> BackendResult<Campaign> {
    Ok(Campaign {
        id: CampaignID(row.try_get("id")?),
        uuid: CampaignUUID(row.try_get("uuid")?),
        name: row.try_get("name")?,
        group_id: GroupID(row.try_get("group_id")?),
        points: Vec::new(),
    })
}

pub(crate) fn campaign_point(row: &PgRow) -> BackendResult<CampaignPoint> {
    Ok(CampaignPoint {
        id: PointID(row.try_get("id")?),
        uuid: PointUUID(row.try_get("uuid")?),
        campaign_id: CampaignID(row.try_get("campaign_id")?),
        relative_to: row.try_get("relative_to")?,
        offset: row.try_get("offset")?,
        unit: get_enum(row, "unit")?,
        delivery_hour: row.try_get("delivery_hour")?,
        action: get_json(row, "action")?,
        start_mode: get_enum(row, "start_mode")?,
        status: get_enum(row, "status")?,
        fire_version: row.try_get("fire_version")?,
    })
}

pub(crate) fn trigger(row: &PgRow) -> BackendResult<Trigger> {
    Ok(Trigger {
        id: TriggerID(row.try_get("id")?),
        org_id: OrgID(row.try_get("org_id")?),
        trigger_type: get_enum(row, "trigger_type")?,
        flow_id: FlowID(row.try_get("flow_id")?),
        keywords: row.try_get("keywords")?,
        match_type: get_opt_enum(row, "match_type")?,
        channel_id: get_opt_id(row, "channel_id")?,
        referrer_id: row.try_get("referrer_id")?,
        include_group_ids: get_ids(row, "include_group_ids")?,
        exclude_group_ids: get_ids(row, "exclude_group_ids")?,
    })
}

/// A contact without its URNs, groups or open tickets, which are loaded separately.
pub(crate) fn contact(row: &PgRow) -> BackendResult<Contact> {
    let session: Option<Uuid> = row.try_get("current_session_uuid")?;
    Ok(Contact {
        id: ContactID(row.try_get("id")?),
        uuid: ContactUUID(row.try_get("uuid")?),
        org_id: OrgID(row.try_get("org_id")?),
        name: row.try_get("name")?,
        language: row.try_get("language")?,
        status: get_enum(row, "status")?,
        timezone: row.try_get("timezone")?,
        created_on: row.try_get("created_on")?,
        modified_on: row.try_get("modified_on")?,
        last_seen_on: row.try_get("last_seen_on")?,
        current_session_uuid: session.map(SessionUUID),
        current_flow_id: get_opt_id(row, "current_flow_id")?,
        urns: Vec::new(),
        group_ids: Vec::new(),
        fields: get_json(row, "fields")?,
        open_ticket_ids: Vec::new(),
    })
}

pub(crate) fn contact_urn(row: &PgRow) -> BackendResult<ContactURN> {
    let scheme: String = row.try_get("scheme")?;
    let path: String = row.try_get("path")?;
    let display: Option<String> = row.try_get("display")?;
    let urn = URN::new(&scheme, &path, display.as_deref())
        .map_err(|err| BackendError::Message(err.to_string()))?;
    Ok(ContactURN {
        id: URNID(row.try_get("id")?),
        contact_id: get_opt_id(row, "contact_id")?,
        urn,
        priority: row.try_get("priority")?,
        channel_id: get_opt_id(row, "channel_id")?,
        auth_tokens: get_json::<BTreeMap<String, String>>(row, "auth_tokens")?,
    })
}

pub(crate) fn session(row: &PgRow) -> BackendResult<Session> {
    let current_flow: Option<Uuid> = row.try_get("current_flow_uuid")?;
    let last_sprint: Option<Uuid> = row.try_get("last_sprint_uuid")?;
    Ok(Session {
        uuid: SessionUUID(row.try_get("uuid")?),
        org_id: OrgID(row.try_get("org_id")?),
        contact_id: ContactID(row.try_get("contact_id")?),
        session_type: get_enum(row, "session_type")?,
        status: get_enum(row, "status")?,
        current_flow_uuid: current_flow.map(FlowUUID),
        last_sprint_uuid: last_sprint.map(SprintUUID),
        output: row.try_get("output")?,
        call_id: get_opt_id(row, "call_id")?,
        created_on: row.try_get("created_on")?,
        ended_on: row.try_get("ended_on")?,
    })
}

pub(crate) fn msg(row: &PgRow) -> BackendResult<Msg> {
    Ok(Msg {
        id: MsgID(row.try_get("id")?),
        uuid: MsgUUID(row.try_get("uuid")?),
        org_id: OrgID(row.try_get("org_id")?),
        channel_id: get_opt_id(row, "channel_id")?,
        contact_id: ContactID(row.try_get("contact_id")?),
        contact_urn_id: get_opt_id(row, "contact_urn_id")?,
        direction: get_enum(row, "direction")?,
        status: get_enum(row, "status")?,
        visibility: get_enum(row, "visibility")?,
        msg_type: get_enum(row, "msg_type")?,
        text: row.try_get("text")?,
        attachments: row.try_get("attachments")?,
        quick_replies: row.try_get("quick_replies")?,
        locale: row.try_get("locale")?,
        flow_id: get_opt_id(row, "flow_id")?,
        ticket_id: get_opt_id(row, "ticket_id")?,
        broadcast_id: get_opt_id(row, "broadcast_id")?,
        optin_id: get_opt_id(row, "optin_id")?,
        created_by_id: get_opt_id(row, "created_by_id")?,
        external_id: row.try_get("external_id")?,
        high_priority: row.try_get("high_priority")?,
        error_count: row.try_get("error_count")?,
        failed_reason: row.try_get("failed_reason")?,
        created_on: row.try_get("created_on")?,
        modified_on: row.try_get("modified_on")?,
        sent_on: row.try_get("sent_on")?,
    })
}

pub(crate) fn ticket(row: &PgRow) -> BackendResult<Ticket> {
    Ok(Ticket {
        id: TicketID(row.try_get("id")?),
        uuid: TicketUUID(row.try_get("uuid")?),
        org_id: OrgID(row.try_get("org_id")?),
        contact_id: ContactID(row.try_get("contact_id")?),
        topic_id: get_opt_id(row, "topic_id")?,
        assignee_id: get_opt_id(row, "assignee_id")?,
        status: get_enum(row, "status")?,
        opened_in_flow_id: get_opt_id(row, "opened_in_flow_id")?,
        opened_by_id: get_opt_id(row, "opened_by_id")?,
        opened_on: row.try_get("opened_on")?,
        closed_on: row.try_get("closed_on")?,
        last_activity_on: row.try_get("last_activity_on")?,
        modified_on: row.try_get("modified_on")?,
    })
}

pub(crate) fn fire(row: &PgRow) -> BackendResult<ContactFire> {
    let session: Option<Uuid> = row.try_get("session_uuid")?;
    let sprint: Option<Uuid> = row.try_get("sprint_uuid")?;
    Ok(ContactFire {
        id: FireID(row.try_get("id")?),
        org_id: OrgID(row.try_get("org_id")?),
        contact_id: ContactID(row.try_get("contact_id")?),
        fire_type: get_enum(row, "fire_type")?,
        scope: row.try_get("scope")?,
        fire_on: row.try_get("fire_on")?,
        session_uuid: session.map(SessionUUID),
        sprint_uuid: sprint.map(SprintUUID),
        extra: get_json(row, "extra")?,
    })
}

pub(crate) fn call(row: &PgRow) -> BackendResult<Call> {
    let session: Option<Uuid> = row.try_get("session_uuid")?;
    Ok(Call {
        id: CallID(row.try_get("id")?),
        uuid: CallUUID(row.try_get("uuid")?),
        org_id: OrgID(row.try_get("org_id")?),
        channel_id: ChannelID(row.try_get("channel_id")?),
        contact_id: ContactID(row.try_get("contact_id")?),
        urn_id: URNID(row.try_get("urn_id")?),
        direction: get_enum(row, "direction")?,
        status: get_enum(row, "status")?,
        external_id: row.try_get("external_id")?,
        duration: row.try_get("duration")?,
        error_reason: get_opt_enum(row, "error_reason")?,
        error_count: row.try_get("error_count")?,
        next_attempt: row.try_get("next_attempt")?,
        session_uuid: session.map(SessionUUID),
        trigger: row.try_get("trigger")?,
        created_on: row.try_get("created_on")?,
        modified_on: row.try_get("modified_on")?,
        started_on: row.try_get("started_on")?,
        ended_on: row.try_get("ended_on")?,
    })
}

pub(crate) fn flow_start(row: &PgRow) -> BackendResult<FlowStart> {
    Ok(FlowStart {
        id: StartID(row.try_get("id")?),
        uuid: StartUUID(row.try_get("uuid")?),
        org_id: OrgID(row.try_get("org_id")?),
        flow_id: FlowID(row.try_get("flow_id")?),
        start_type: get_enum(row, "start_type")?,
        status: get_enum(row, "status")?,
        exclusions: get_json(row, "exclusions")?,
        contact_ids: get_ids(row, "contact_ids")?,
        group_ids: get_ids(row, "group_ids")?,
        urns: get_urns(row, "urns")?,
        query: row.try_get("query")?,
        created_by_id: get_opt_id(row, "created_by_id")?,
        params: row.try_get("params")?,
        parent_summary: row.try_get("parent_summary")?,
        session_history: row.try_get("session_history")?,
        contact_count: row.try_get("contact_count")?,
        created_on: row.try_get("created_on")?,
        modified_on: row.try_get("modified_on")?,
    })
}

pub(crate) fn broadcast(row: &PgRow) -> BackendResult<Broadcast> {
    Ok(Broadcast {
        id: BroadcastID(row.try_get("id")?),
        uuid: BroadcastUUID(row.try_get("uuid")?),
        org_id: OrgID(row.try_get("org_id")?),
        translations: get_json(row, "translations")?,
        base_language: row.try_get("base_language")?,
        optin_id: get_opt_id(row, "optin_id")?,
        contact_ids: get_ids(row, "contact_ids")?,
        group_ids: get_ids(row, "group_ids")?,
        urns: get_urns(row, "urns")?,
        query: row.try_get("query")?,
        exclusions: get_json(row, "exclusions")?,
        created_by_id: get_opt_id(row, "created_by_id")?,
        created_on: row.try_get("created_on")?,
    })
}

pub(crate) fn incident(row: &PgRow) -> BackendResult<Incident> {
    Ok(Incident {
        id: IncidentID(row.try_get("id")?),
        org_id: OrgID(row.try_get("org_id")?),
        incident_type: row.try_get("incident_type")?,
        scope: row.try_get("scope")?,
        started_on: row.try_get("started_on")?,
        ended_on: row.try_get("ended_on")?,
    })
}

#[cfg(test)]
mod tests {
    use mailroom_models::{ContactStatus, FireType, MsgVisibility, TriggerType};

    use super::*;

    #[test]
    fn enum_text_uses_serde_names() {
        assert_eq!(enum_text(&FireType::WaitExpires).unwrap(), "wait_expires");
        assert_eq!(
            enum_text(&MsgVisibility::DeletedBySender).unwrap(),
            "deleted_by_sender"
        );
        assert_eq!(
            parse_enum::<TriggerType>("new_conversation".to_string()).unwrap(),
            TriggerType::NewConversation
        );
        assert_eq!(
            parse_enum::<ContactStatus>("stopped".to_string()).unwrap(),
            ContactStatus::Stopped
        );
        assert!(parse_enum::<ContactStatus>("gone".to_string()).is_err());
    }
}
