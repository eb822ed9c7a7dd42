//! Seeded org, contacts and flows shared by the unit tests.
//!
//! Every test gets its own [`MemoryBackend`] holding one org with three
//! contacts, a Twilio channel answered by [`ScriptedIvr`], a messaging flow
//! that asks for a favorite color and a short voice survey.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{TimeZone, Utc};
use mailroom_backend_memory::MemoryBackend;
use mailroom_flows::basic::BasicEngine;
use mailroom_flows::{Event, EventKind, FlowRef, Session, Trigger};
use mailroom_models::{
    BroadcastTranslation, Campaign, CampaignID, CampaignPoint, CampaignUUID, Channel, ChannelID,
    ChannelRole, ChannelUUID, Contact, ContactID, ContactStatus, ContactURN, ContactUUID, Field,
    FieldID, FieldUUID, FieldValue, FieldValueType, Flow, FlowID, FlowType, FlowUUID, Group,
    GroupID, GroupType, GroupUUID, KeywordMatchType, MsgDirection, MsgID, MsgStatus, MsgType,
    MsgUUID, MsgVisibility, NO_DELIVERY_HOUR, OffsetUnit, Org, OrgID, OrgUUID, PointAction,
    PointID, PointStatus, PointUUID, StartMode, Ticket, TicketStatus, TicketUUID, Topic, TopicID,
    TopicUUID, Trigger as TriggerRow, TriggerID, TriggerType, URN, URNID, User, UserID, UserUUID,
};
use serde_json::json;

use crate::assets::OrgAssets;
use crate::config::Config;
use crate::ivr::twiml::{self, TwimlService};
use crate::ivr::{
    CallCallbacks, CallbackRequest, IvrError, IvrResult, IvrResume, Media, Service,
    ServiceRegistry, StatusUpdate,
};
use crate::runtime::Runtime;
use crate::scene::Scene;
use crate::tasks::MsgReceived;

pub const ORG: OrgID = OrgID(1);
pub const ADMIN: UserID = UserID(1);

pub const ANN: ContactID = ContactID(10000);
pub const BOB: ContactID = ContactID(10001);
pub const CAT: ContactID = ContactID(10002);

pub const TWILIO: ChannelID = ChannelID(10000);

pub const FAVORITES: FlowID = FlowID(10000);
pub const VOICE_FLOW: FlowID = FlowID(10001);

pub const DOCTORS: GroupID = GroupID(10000);
pub const TWENTIES: GroupID = GroupID(10001);

pub const JOINED_POINT: PointID = PointID(10000);
pub const REMINDER_POINT: PointID = PointID(10001);

pub const TWILIO_AUTH_TOKEN: &str = "sesame";

pub struct Fixture {
    pub rt: Runtime,
    pub mem: MemoryBackend,
    pub ivr: Arc<ScriptedIvr>,
}

pub async fn fixture() -> Fixture {
    let mem = MemoryBackend::new();
    mem.seed(seed_org);

    let ivr = Arc::new(ScriptedIvr::default());
    let rt = Runtime::new(
        Box::new(mem.clone()),
        Box::new(mem.clone()),
        Arc::new(BasicEngine::new()),
        Config::test_config(),
    )
    .with_ivr(ServiceRegistry::default().register(twiml::TWILIO_CHANNEL_TYPE, ivr.clone()));

    Fixture { rt, mem, ivr }
}

impl Fixture {
    /// A fresh scene for a contact as currently stored.
    pub fn scene(&self, assets: &OrgAssets, contact_id: ContactID) -> Scene {
        let store = self.mem.snapshot();
        let contact = store.contacts[&contact_id].clone();
        let tickets: Vec<Ticket> = store
            .tickets
            .values()
            .filter(|t| t.contact_id == contact_id && t.status == TicketStatus::Open)
            .cloned()
            .collect();
        Scene::for_contact(assets, contact, tickets)
    }

    pub fn manual_trigger(&self, assets: &OrgAssets, flow_id: FlowID) -> Trigger {
        let flow = assets.flow_by_id(flow_id).expect("flow is seeded");
        Trigger::Manual {
            flow: FlowRef::from(flow),
            params: None,
            user: None,
        }
    }

    /// Start Favorites for a contact and commit, returning the new session.
    pub async fn start_favorites(&self, contact_id: ContactID) -> mailroom_models::SessionUUID {
        let assets = self.rt.org_assets(ORG).await.expect("org assets load");
        let mut scene = self.scene(&assets, contact_id);
        scene
            .start_session(&self.rt, &assets, self.manual_trigger(&assets, FAVORITES), true)
            .await
            .expect("favorites starts");
        let uuid = scene.session().map(|s: &Session| s.uuid).expect("session started");
        scene.commit(&self.rt, &assets).await.expect("start commits");
        uuid
    }

    /// Open a ticket on the default topic the way a flow would.
    pub async fn open_ticket(&self, contact_id: ContactID) -> Ticket {
        let assets = self.rt.org_assets(ORG).await.expect("org assets load");
        let ticket_uuid = TicketUUID::new();
        let mut scene = self.scene(&assets, contact_id);
        scene
            .add_event(
                &assets,
                Event::new(EventKind::TicketOpened {
                    ticket_uuid,
                    topic: None,
                    assignee: None,
                    note: None,
                }),
                None,
            )
            .expect("ticket event is handled");
        scene.commit(&self.rt, &assets).await.expect("ticket commits");

        self.mem
            .snapshot()
            .tickets
            .into_values()
            .find(|t| t.uuid == ticket_uuid)
            .expect("ticket was inserted")
    }

    /// Store a pending incoming message and return the task that reports it.
    pub async fn incoming(&self, contact_id: ContactID, text: &str) -> MsgReceived {
        let now = Utc::now();
        self.mem.seed(|store| {
            let urn = store.contacts[&contact_id].urns[0].clone();
            let id = MsgID(store.next_id());
            let uuid = MsgUUID::new();
            store.msgs.insert(
                id,
                msg_row(id, uuid, contact_id, urn.id, MsgDirection::In, MsgStatus::Pending, text, now),
            );
            MsgReceived {
                channel_id: TWILIO,
                msg_id: id,
                msg_uuid: uuid,
                msg_external_id: None,
                urn: urn.urn,
                urn_id: urn.id,
                text: text.to_string(),
                attachments: vec![],
                new_contact: false,
            }
        })
    }

    /// Store an outgoing message already handed to the channel.
    pub async fn outgoing(&self, contact_id: ContactID, text: &str) -> MsgID {
        let now = Utc::now();
        self.mem.seed(|store| {
            let urn_id = store.contacts[&contact_id].urns[0].id;
            let id = MsgID(store.next_id());
            store.msgs.insert(
                id,
                msg_row(id, MsgUUID::new(), contact_id, urn_id, MsgDirection::Out, MsgStatus::Wired, text, now),
            );
            id
        })
    }
}

#[allow(clippy::too_many_arguments)]
fn msg_row(
    id: MsgID,
    uuid: MsgUUID,
    contact_id: ContactID,
    urn_id: URNID,
    direction: MsgDirection,
    status: MsgStatus,
    text: &str,
    now: chrono::DateTime<Utc>,
) -> mailroom_models::Msg {
    mailroom_models::Msg {
        id,
        uuid,
        org_id: ORG,
        channel_id: Some(TWILIO),
        contact_id,
        contact_urn_id: Some(urn_id),
        direction,
        status,
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
        high_priority: direction == MsgDirection::In,
        error_count: 0,
        failed_reason: None,
        created_on: now,
        modified_on: now,
        sent_on: (direction == MsgDirection::Out).then_some(now),
    }
}

/// Voice service that records call requests instead of dialing, and
/// otherwise speaks TwiML.
#[derive(Default)]
pub struct ScriptedIvr {
    twiml: TwimlService,
    requested: Mutex<Vec<(URN, CallCallbacks)>>,
    placed: AtomicUsize,
    failing: AtomicBool,
}

impl ScriptedIvr {
    pub fn requested(&self) -> Vec<(URN, CallCallbacks)> {
        self.requested.lock().expect("requests poisoned").clone()
    }

    pub fn fail_requests(&self, fail: bool) {
        self.failing.store(fail, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl Service for ScriptedIvr {
    async fn request_call(
        &self,
        _channel: &Channel,
        urn: &URN,
        callbacks: &CallCallbacks,
    ) -> IvrResult<String> {
        self.requested
            .lock()
            .expect("requests poisoned")
            .push((urn.clone(), callbacks.clone()));
        if self.failing.load(Ordering::SeqCst) {
            return Err(IvrError::Provider(format!("unable to dial {urn}")));
        }
        let n = self.placed.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("CA-{n}"))
    }

    async fn hangup_call(&self, _channel: &Channel, _external_id: &str) -> IvrResult<()> {
        Ok(())
    }

    fn write_session_response(
        &self,
        session: &Session,
        events: &[Event],
        resume_url: &str,
    ) -> IvrResult<String> {
        self.twiml.write_session_response(session, events, resume_url)
    }

    fn write_reject_response(&self) -> IvrResult<String> {
        self.twiml.write_reject_response()
    }

    fn write_error_response(&self, err: &str) -> IvrResult<String> {
        self.twiml.write_error_response(err)
    }

    fn write_empty_response(&self, msg: &str) -> IvrResult<String> {
        self.twiml.write_empty_response(msg)
    }

    fn resume_for_request(&self, req: &CallbackRequest) -> IvrResult<IvrResume> {
        self.twiml.resume_for_request(req)
    }

    fn status_for_request(&self, req: &CallbackRequest) -> StatusUpdate {
        self.twiml.status_for_request(req)
    }

    fn check_start_request(&self, req: &CallbackRequest) -> Option<mailroom_models::CallError> {
        self.twiml.check_start_request(req)
    }

    fn preprocess_resume(&self, req: &CallbackRequest) -> IvrResult<Option<String>> {
        self.twiml.preprocess_resume(req)
    }

    fn preprocess_status(&self, req: &CallbackRequest) -> IvrResult<Option<String>> {
        self.twiml.preprocess_status(req)
    }

    fn validate_request_signature(&self, channel: &Channel, req: &CallbackRequest) -> IvrResult<()> {
        self.twiml.validate_request_signature(channel, req)
    }

    async fn download_media(&self, _channel: &Channel, url: &str) -> IvrResult<Media> {
        Ok(Media {
            content_type: "audio/mpeg".to_string(),
            url: url.to_string(),
        })
    }

    fn urn_for_request(&self, req: &CallbackRequest) -> IvrResult<URN> {
        self.twiml.urn_for_request(req)
    }

    fn call_id_for_request(&self, req: &CallbackRequest) -> IvrResult<String> {
        self.twiml.call_id_for_request(req)
    }

    fn redact_values(&self, channel: &Channel) -> Vec<String> {
        self.twiml.redact_values(channel)
    }

    fn content_type(&self) -> &'static str {
        self.twiml.content_type()
    }
}

fn seed_org(store: &mut mailroom_backend_memory::Store) {
    let long_ago = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();

    store.orgs.insert(
        ORG,
        Org {
            id: ORG,
            uuid: OrgUUID::new(),
            name: "Nyaruka".to_string(),
            timezone: "America/Los_Angeles".to_string(),
            language: "eng".to_string(),
            is_active: true,
            is_suspended: false,
        },
    );

    let rows = store.org_rows(ORG);
    rows.flows = vec![favorites_flow(), voice_flow()];
    rows.fields = vec![
        field(1, "age", "Age", FieldValueType::Number),
        field(2, "joined", "Joined", FieldValueType::Datetime),
    ];
    rows.groups = vec![
        Group {
            id: DOCTORS,
            uuid: GroupUUID::new(),
            name: "Doctors".to_string(),
            group_type: GroupType::Manual,
            query: None,
        },
        Group {
            id: TWENTIES,
            uuid: GroupUUID::new(),
            name: "In Their Twenties".to_string(),
            group_type: GroupType::Smart,
            query: Some("age >= 20 AND age < 30".to_string()),
        },
    ];
    rows.channels = vec![Channel {
        id: TWILIO,
        uuid: ChannelUUID::new(),
        org_id: ORG,
        name: "Twilio".to_string(),
        channel_type: twiml::TWILIO_CHANNEL_TYPE.to_string(),
        address: "+12065551212".to_string(),
        schemes: vec![mailroom_models::TEL_SCHEME.to_string()],
        roles: vec![
            ChannelRole::Send,
            ChannelRole::Receive,
            ChannelRole::Call,
            ChannelRole::Answer,
        ],
        config: BTreeMap::from([
            (twiml::CONFIG_ACCOUNT_SID.to_string(), json!("AC0123456789")),
            (twiml::CONFIG_AUTH_TOKEN.to_string(), json!(TWILIO_AUTH_TOKEN)),
        ]),
        features: vec![],
    }];
    rows.topics = vec![
        Topic {
            id: TopicID(1),
            uuid: TopicUUID::new(),
            name: "General".to_string(),
            is_default: true,
        },
        Topic {
            id: TopicID(2),
            uuid: TopicUUID::new(),
            name: "Weather".to_string(),
            is_default: false,
        },
    ];
    rows.users = vec![User {
        id: ADMIN,
        uuid: UserUUID::new(),
        email: "admin@nyaruka.com".to_string(),
        name: "Admin".to_string(),
    }];
    rows.campaigns = vec![doctor_reminders()];
    rows.triggers = vec![TriggerRow {
        id: TriggerID(1),
        org_id: ORG,
        trigger_type: TriggerType::Keyword,
        flow_id: FAVORITES,
        keywords: vec!["red".to_string()],
        match_type: Some(KeywordMatchType::FirstWord),
        channel_id: None,
        referrer_id: None,
        include_group_ids: vec![],
        exclude_group_ids: vec![],
    }];

    let joined = Utc::now();
    for (id, name, phone, groups, fields) in [
        (ANN, "Ann", "+16055741111", vec![DOCTORS], BTreeMap::new()),
        (
            BOB,
            "Bob",
            "+16055742222",
            vec![],
            BTreeMap::from([("age".to_string(), FieldValue::parse("35"))]),
        ),
        (
            CAT,
            "Cat",
            "+16055743333",
            vec![],
            BTreeMap::from([("joined".to_string(), FieldValue::parse(&joined.to_rfc3339()))]),
        ),
    ] {
        store.contacts.insert(
            id,
            Contact {
                id,
                uuid: ContactUUID::new(),
                org_id: ORG,
                name: Some(name.to_string()),
                language: None,
                status: ContactStatus::Active,
                timezone: None,
                created_on: long_ago,
                modified_on: long_ago,
                last_seen_on: None,
                current_session_uuid: None,
                current_flow_id: None,
                urns: vec![ContactURN {
                    id: URNID(id.0),
                    contact_id: Some(id),
                    urn: URN::new(mailroom_models::TEL_SCHEME, phone, None).unwrap(),
                    priority: 1000,
                    channel_id: None,
                    auth_tokens: BTreeMap::new(),
                }],
                group_ids: groups,
                fields,
                open_ticket_ids: vec![],
            },
        );
    }
}

fn field(id: i64, key: &str, name: &str, value_type: FieldValueType) -> Field {
    Field {
        id: FieldID(id),
        uuid: FieldUUID::new(),
        key: key.to_string(),
        name: name.to_string(),
        value_type,
        is_system: false,
    }
}

fn doctor_reminders() -> Campaign {
    let campaign_id = CampaignID(1);
    let point = |id: PointID, relative_to: &str, action: PointAction, start_mode| CampaignPoint {
        id,
        uuid: PointUUID::new(),
        campaign_id,
        relative_to: relative_to.to_string(),
        offset: 1,
        unit: OffsetUnit::Days,
        delivery_hour: NO_DELIVERY_HOUR,
        action,
        start_mode,
        status: PointStatus::Ready,
        fire_version: 1,
    };
    Campaign {
        id: campaign_id,
        uuid: CampaignUUID::new(),
        name: "Doctor Reminders".to_string(),
        group_id: DOCTORS,
        points: vec![
            point(
                JOINED_POINT,
                "joined",
                PointAction::Flow { flow_id: FAVORITES },
                StartMode::Skip,
            ),
            point(
                REMINDER_POINT,
                "created_on",
                PointAction::Broadcast {
                    translations: BTreeMap::from([(
                        "eng".to_string(),
                        BroadcastTranslation {
                            text: "Don't forget your appointment tomorrow".to_string(),
                            ..Default::default()
                        },
                    )]),
                    base_language: "eng".to_string(),
                },
                StartMode::Interrupt,
            ),
        ],
    }
}

const COLOR_MSG: &str = "5a9d0f0a-0000-4000-8000-000000000001";
const COLOR_WAIT: &str = "5a9d0f0a-0000-4000-8000-000000000002";
const BEER_MSG: &str = "5a9d0f0a-0000-4000-8000-000000000003";
const BEER_WAIT: &str = "5a9d0f0a-0000-4000-8000-000000000004";
const THANKS_MSG: &str = "5a9d0f0a-0000-4000-8000-000000000005";

/// Asks for a color (five minutes to answer), then a beer, then thanks.
fn favorites_flow() -> Flow {
    Flow {
        id: FAVORITES,
        uuid: "9de3663f-c5c5-4c92-9f45-ecbc09abcc85".parse().unwrap(),
        org_id: ORG,
        name: "Favorites".to_string(),
        flow_type: FlowType::Messaging,
        definition: json!({
            "nodes": [
                {
                    "uuid": COLOR_MSG,
                    "actions": [{
                        "uuid": "6b1c0a11-0000-4000-8000-000000000001",
                        "type": "send_msg",
                        "text": "What is your favorite color?"
                    }],
                    "exits": [{"uuid": "7e7e0000-0000-4000-8000-000000000001", "destination_uuid": COLOR_WAIT}]
                },
                {
                    "uuid": COLOR_WAIT,
                    "router": {
                        "wait": {
                            "type": "msg",
                            "timeout_seconds": 300,
                            "timeout_category_uuid": "c47e0000-0000-4000-8000-000000000005"
                        },
                        "result_name": "Color",
                        "cases": [
                            {"uuid": "ca5e0000-0000-4000-8000-000000000001", "type": "has_any_word",
                             "arguments": ["red"], "category_uuid": "c47e0000-0000-4000-8000-000000000001"},
                            {"uuid": "ca5e0000-0000-4000-8000-000000000002", "type": "has_any_word",
                             "arguments": ["green"], "category_uuid": "c47e0000-0000-4000-8000-000000000002"},
                            {"uuid": "ca5e0000-0000-4000-8000-000000000003", "type": "has_any_word",
                             "arguments": ["blue"], "category_uuid": "c47e0000-0000-4000-8000-000000000003"}
                        ],
                        "categories": [
                            {"uuid": "c47e0000-0000-4000-8000-000000000001", "name": "Red",
                             "exit_uuid": "7e7e0000-0000-4000-8000-000000000002"},
                            {"uuid": "c47e0000-0000-4000-8000-000000000002", "name": "Green",
                             "exit_uuid": "7e7e0000-0000-4000-8000-000000000002"},
                            {"uuid": "c47e0000-0000-4000-8000-000000000003", "name": "Blue",
                             "exit_uuid": "7e7e0000-0000-4000-8000-000000000002"},
                            {"uuid": "c47e0000-0000-4000-8000-000000000004", "name": "Other",
                             "exit_uuid": "7e7e0000-0000-4000-8000-000000000003"},
                            {"uuid": "c47e0000-0000-4000-8000-000000000005", "name": "No Response",
                             "exit_uuid": "7e7e0000-0000-4000-8000-000000000004"}
                        ],
                        "default_category_uuid": "c47e0000-0000-4000-8000-000000000004"
                    },
                    "exits": [
                        {"uuid": "7e7e0000-0000-4000-8000-000000000002", "destination_uuid": BEER_MSG},
                        {"uuid": "7e7e0000-0000-4000-8000-000000000003", "destination_uuid": COLOR_MSG},
                        {"uuid": "7e7e0000-0000-4000-8000-000000000004", "destination_uuid": null}
                    ]
                },
                {
                    "uuid": BEER_MSG,
                    "actions": [{
                        "uuid": "6b1c0a11-0000-4000-8000-000000000002",
                        "type": "send_msg",
                        "text": "Good choice, I like @results.color too! What is your favorite beer?"
                    }],
                    "exits": [{"uuid": "7e7e0000-0000-4000-8000-000000000005", "destination_uuid": BEER_WAIT}]
                },
                {
                    "uuid": BEER_WAIT,
                    "router": {
                        "wait": {"type": "msg"},
                        "result_name": "Beer",
                        "categories": [
                            {"uuid": "c47e0000-0000-4000-8000-000000000006", "name": "All Responses",
                             "exit_uuid": "7e7e0000-0000-4000-8000-000000000006"}
                        ],
                        "default_category_uuid": "c47e0000-0000-4000-8000-000000000006"
                    },
                    "exits": [
                        {"uuid": "7e7e0000-0000-4000-8000-000000000006", "destination_uuid": THANKS_MSG}
                    ]
                },
                {
                    "uuid": THANKS_MSG,
                    "actions": [{
                        "uuid": "6b1c0a11-0000-4000-8000-000000000003",
                        "type": "send_msg",
                        "text": "Mmmm... delicious @results.beer. Thanks, we are all done!"
                    }],
                    "exits": [{"uuid": "7e7e0000-0000-4000-8000-000000000007", "destination_uuid": null}]
                }
            ],
            "_ui": {
                "nodes": {
                    COLOR_WAIT: {"type": "wait_for_response"},
                    BEER_WAIT: {"type": "wait_for_response"}
                }
            }
        }),
        ignore_triggers: false,
        ivr_retry_minutes: None,
        is_active: true,
    }
}

const VOICE_WELCOME: &str = "b01ce000-0000-4000-8000-000000000001";
const VOICE_MENU: &str = "b01ce000-0000-4000-8000-000000000002";
const VOICE_THANKS: &str = "b01ce000-0000-4000-8000-000000000003";

/// Gathers a digit and thanks the caller.
fn voice_flow() -> Flow {
    Flow {
        id: VOICE_FLOW,
        uuid: FlowUUID::new(),
        org_id: ORG,
        name: "IVR Survey".to_string(),
        flow_type: FlowType::Voice,
        definition: json!({
            "nodes": [
                {
                    "uuid": VOICE_WELCOME,
                    "actions": [{
                        "uuid": "6b1c0a11-0000-4000-8000-000000000011",
                        "type": "say_msg",
                        "text": "Welcome to the clinic survey. Press 1 if you visited us this week."
                    }],
                    "exits": [{"uuid": "7e7e0000-0000-4000-8000-000000000011", "destination_uuid": VOICE_MENU}]
                },
                {
                    "uuid": VOICE_MENU,
                    "router": {
                        "wait": {"type": "msg", "hint": "digits"},
                        "result_name": "Visited",
                        "cases": [
                            {"uuid": "ca5e0000-0000-4000-8000-000000000011", "type": "is_text_eq",
                             "arguments": ["1"], "category_uuid": "c47e0000-0000-4000-8000-000000000011"}
                        ],
                        "categories": [
                            {"uuid": "c47e0000-0000-4000-8000-000000000011", "name": "Yes",
                             "exit_uuid": "7e7e0000-0000-4000-8000-000000000012"},
                            {"uuid": "c47e0000-0000-4000-8000-000000000012", "name": "Other",
                             "exit_uuid": "7e7e0000-0000-4000-8000-000000000013"}
                        ],
                        "default_category_uuid": "c47e0000-0000-4000-8000-000000000012"
                    },
                    "exits": [
                        {"uuid": "7e7e0000-0000-4000-8000-000000000012", "destination_uuid": VOICE_THANKS},
                        {"uuid": "7e7e0000-0000-4000-8000-000000000013", "destination_uuid": VOICE_WELCOME}
                    ]
                },
                {
                    "uuid": VOICE_THANKS,
                    "actions": [{
                        "uuid": "6b1c0a11-0000-4000-8000-000000000012",
                        "type": "say_msg",
                        "text": "Thanks for your time, goodbye."
                    }],
                    "exits": [{"uuid": "7e7e0000-0000-4000-8000-000000000014", "destination_uuid": null}]
                }
            ]
        }),
        ignore_triggers: false,
        ivr_retry_minutes: None,
        is_active: true,
    }
}
