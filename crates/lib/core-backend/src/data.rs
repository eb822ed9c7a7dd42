// Write payloads for the transactional half of the core backend. Rows that
// are written whole (messages, tickets, fires...) use the model types directly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use mailroom_models::{
    ContactID, FieldValue, FlowID, GroupID, LabelID, MsgID, MsgStatus, MsgUUID, OrgID, PointID,
    SessionUUID, TicketID, URN,
};

/// New values of a contact's session pointers. Both are cleared together.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContactSessionUpdate {
    pub contact_id: ContactID,
    pub session_uuid: Option<SessionUUID>,
    pub flow_id: Option<FlowID>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContactFieldUpdate {
    pub contact_id: ContactID,
    pub key: String,
    pub value: Option<FieldValue>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupMembership {
    pub contact_id: ContactID,
    pub group_id: GroupID,
}

/// The full, ordered URN list a contact should end up with. URNs owned by
/// other contacts in the org are taken over.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContactURNsUpdate {
    pub org_id: OrgID,
    pub contact_id: ContactID,
    pub urns: Vec<URN>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MsgHandled {
    pub msg_id: MsgID,
    pub flow_id: Option<FlowID>,
    pub ticket_id: Option<TicketID>,
    /// Messages from blocked contacts are archived rather than left visible.
    pub archive: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MsgStatusUpdate {
    pub msg_id: MsgID,
    pub status: MsgStatus,
    pub external_id: Option<String>,
    pub failed_reason: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MsgDeletion {
    pub org_id: OrgID,
    pub msg_uuid: MsgUUID,
    pub by_contact: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgLabel {
    pub msg_uuid: MsgUUID,
    pub label_id: LabelID,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CampaignFireKey {
    pub contact_id: ContactID,
    pub point_id: PointID,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResthookUnsubscribe {
    pub org_id: OrgID,
    pub slug: String,
    pub url: String,
}
