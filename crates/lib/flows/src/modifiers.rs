//! Modifiers are requested changes to a contact. Applying one mutates the
//! flow contact and returns the events describing what actually changed, so
//! a modifier that changes nothing produces no events.

use serde::{Deserialize, Serialize};

use mailroom_models::{ContactStatus, FieldValue, TicketStatus, TicketUUID, URN};

use crate::{Event, EventKind, FieldRef, FlowContact, GroupRef, TopicRef, UserRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupModification {
    Add,
    Remove,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum URNModification {
    Append,
    Set,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Modifier {
    Name {
        name: Option<String>,
    },
    Language {
        language: Option<String>,
    },
    Status {
        status: ContactStatus,
    },
    Field {
        field: FieldRef,
        value: Option<String>,
    },
    Groups {
        groups: Vec<GroupRef>,
        modification: GroupModification,
    },
    Urns {
        urns: Vec<URN>,
        modification: URNModification,
    },
    TicketAssignee {
        ticket_uuids: Vec<TicketUUID>,
        assignee: Option<UserRef>,
    },
    TicketNote {
        ticket_uuids: Vec<TicketUUID>,
        note: String,
    },
    TicketTopic {
        ticket_uuids: Vec<TicketUUID>,
        topic: TopicRef,
    },
    TicketClose {
        ticket_uuids: Vec<TicketUUID>,
    },
    TicketReopen {
        ticket_uuids: Vec<TicketUUID>,
    },
}

impl Modifier {
    pub fn apply(&self, contact: &mut FlowContact) -> Vec<Event> {
        let mut events = Vec::new();
        match self {
            Self::Name { name } => {
                let name = name.as_ref().map(|n| n.trim().to_string()).filter(|n| !n.is_empty());
                if contact.name != name {
                    contact.name = name.clone();
                    events.push(Event::new(EventKind::ContactNameChanged {
                        name: name.unwrap_or_default(),
                    }));
                }
            }
            Self::Language { language } => {
                let language = language.clone().filter(|l| !l.is_empty());
                if contact.language != language {
                    contact.language = language.clone();
                    events.push(Event::new(EventKind::ContactLanguageChanged {
                        language: language.unwrap_or_default(),
                    }));
                }
            }
            Self::Status { status } => {
                if contact.status != *status {
                    contact.status = *status;
                    events.push(Event::new(EventKind::ContactStatusChanged { status: *status }));

                    // blocked and stopped contacts leave all their groups
                    if matches!(status, ContactStatus::Blocked | ContactStatus::Stopped)
                        && !contact.groups.is_empty()
                    {
                        let removed = std::mem::take(&mut contact.groups);
                        events.push(Event::new(EventKind::ContactGroupsChanged {
                            groups_added: vec![],
                            groups_removed: removed,
                        }));
                    }
                }
            }
            Self::Field { field, value } => {
                let value = value
                    .as_deref()
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                    .map(FieldValue::parse);
                let existing = contact.fields.get(&field.key);
                if existing != value.as_ref() {
                    match &value {
                        Some(v) => contact.fields.insert(field.key.clone(), v.clone()),
                        None => contact.fields.remove(&field.key),
                    };
                    events.push(Event::new(EventKind::ContactFieldChanged {
                        field: field.clone(),
                        value,
                    }));
                }
            }
            Self::Groups {
                groups,
                modification,
            } => {
                let mut changed = Vec::new();
                for group in groups {
                    match modification {
                        GroupModification::Add if !contact.in_group(group.uuid) => {
                            contact.groups.push(group.clone());
                            changed.push(group.clone());
                        }
                        GroupModification::Remove if contact.in_group(group.uuid) => {
                            contact.groups.retain(|g| g.uuid != group.uuid);
                            changed.push(group.clone());
                        }
                        _ => {}
                    }
                }
                // only active contacts can be added to groups
                if *modification == GroupModification::Add
                    && contact.status != ContactStatus::Active
                {
                    contact.groups.retain(|g| !changed.contains(g));
                    changed.clear();
                }
                if !changed.is_empty() {
                    let (groups_added, groups_removed) = match modification {
                        GroupModification::Add => (changed, vec![]),
                        GroupModification::Remove => (vec![], changed),
                    };
                    events.push(Event::new(EventKind::ContactGroupsChanged {
                        groups_added,
                        groups_removed,
                    }));
                }
            }
            Self::Urns { urns, modification } => {
                let before = contact.urns.clone();
                match modification {
                    URNModification::Append => {
                        for urn in urns {
                            if !contact.urns.iter().any(|u| u.identity() == urn.identity()) {
                                contact.urns.push(urn.clone());
                            }
                        }
                    }
                    URNModification::Set => {
                        let mut seen = Vec::new();
                        contact.urns = urns
                            .iter()
                            .filter(|u| {
                                let identity = u.identity();
                                let fresh = !seen.contains(&identity);
                                seen.push(identity);
                                fresh
                            })
                            .cloned()
                            .collect();
                    }
                    URNModification::Remove => {
                        contact
                            .urns
                            .retain(|u| !urns.iter().any(|r| r.identity() == u.identity()));
                    }
                }
                if contact.urns != before {
                    events.push(Event::new(EventKind::ContactUrnsChanged {
                        urns: contact.urns.clone(),
                    }));
                }
            }
            Self::TicketAssignee {
                ticket_uuids,
                assignee,
            } => {
                for uuid in ticket_uuids {
                    if let Some(ticket) = contact.ticket_mut(*uuid)
                        && ticket.assignee != *assignee
                    {
                        ticket.assignee = assignee.clone();
                        events.push(Event::new(EventKind::TicketAssigneeChanged {
                            ticket_uuid: *uuid,
                            assignee: assignee.clone(),
                        }));
                    }
                }
            }
            Self::TicketNote { ticket_uuids, note } => {
                for uuid in ticket_uuids {
                    if contact.ticket_mut(*uuid).is_some() {
                        events.push(Event::new(EventKind::TicketNoteAdded {
                            ticket_uuid: *uuid,
                            note: note.clone(),
                        }));
                    }
                }
            }
            Self::TicketTopic {
                ticket_uuids,
                topic,
            } => {
                for uuid in ticket_uuids {
                    if let Some(ticket) = contact.ticket_mut(*uuid)
                        && ticket.topic.as_ref() != Some(topic)
                    {
                        ticket.topic = Some(topic.clone());
                        events.push(Event::new(EventKind::TicketTopicChanged {
                            ticket_uuid: *uuid,
                            topic: topic.clone(),
                        }));
                    }
                }
            }
            Self::TicketClose { ticket_uuids } => {
                for uuid in ticket_uuids {
                    if let Some(ticket) = contact.ticket_mut(*uuid)
                        && ticket.status == TicketStatus::Open
                    {
                        ticket.status = TicketStatus::Closed;
                        events.push(Event::new(EventKind::TicketClosed { ticket_uuid: *uuid }));
                    }
                }
            }
            Self::TicketReopen { ticket_uuids } => {
                // a contact can only have one open ticket at a time
                if contact.tickets.iter().any(|t| t.status == TicketStatus::Open) {
                    return events;
                }
                if let Some(uuid) = ticket_uuids.first()
                    && let Some(ticket) = contact.ticket_mut(*uuid)
                    && ticket.status == TicketStatus::Closed
                {
                    ticket.status = TicketStatus::Open;
                    events.push(Event::new(EventKind::TicketReopened { ticket_uuid: *uuid }));
                }
            }
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Utc;
    use mailroom_models::{ContactID, ContactUUID, GroupUUID, TopicUUID};

    use super::*;
    use crate::FlowTicket;

    fn contact() -> FlowContact {
        FlowContact {
            id: ContactID(1),
            uuid: ContactUUID::new(),
            name: Some("Ann".to_string()),
            language: Some("eng".to_string()),
            status: ContactStatus::Active,
            timezone: None,
            created_on: Utc::now(),
            last_seen_on: None,
            urns: vec![URN::parse("tel:+16055741111").unwrap()],
            groups: vec![],
            fields: BTreeMap::new(),
            tickets: vec![],
        }
    }

    fn doctors() -> GroupRef {
        GroupRef {
            uuid: GroupUUID::new(),
            name: "Doctors".to_string(),
        }
    }

    #[test]
    fn name_modifier_noop_when_unchanged() {
        let mut c = contact();
        let events = Modifier::Name {
            name: Some("Ann".to_string()),
        }
        .apply(&mut c);
        assert!(events.is_empty());

        let events = Modifier::Name {
            name: Some("Annie".to_string()),
        }
        .apply(&mut c);
        assert_eq!(events.len(), 1);
        assert_eq!(c.name.as_deref(), Some("Annie"));
    }

    #[test]
    fn groups_modifier_adds_once() {
        let mut c = contact();
        let group = doctors();
        let modifier = Modifier::Groups {
            groups: vec![group.clone()],
            modification: GroupModification::Add,
        };
        assert_eq!(modifier.apply(&mut c).len(), 1);
        assert!(modifier.apply(&mut c).is_empty());
        assert!(c.in_group(group.uuid));
    }

    #[test]
    fn status_modifier_stopping_removes_groups() {
        let mut c = contact();
        c.groups.push(doctors());
        let events = Modifier::Status {
            status: ContactStatus::Stopped,
        }
        .apply(&mut c);
        let types: Vec<_> = events.iter().map(|e| e.type_name()).collect();
        assert_eq!(types, vec!["contact_status_changed", "contact_groups_changed"]);
        assert!(c.groups.is_empty());
    }

    #[test]
    fn field_modifier_parses_value() {
        let mut c = contact();
        let field = FieldRef {
            key: "age".to_string(),
            name: "Age".to_string(),
        };
        let events = Modifier::Field {
            field: field.clone(),
            value: Some("37".to_string()),
        }
        .apply(&mut c);
        assert_eq!(events.len(), 1);
        assert_eq!(c.fields["age"].number, Some(37.0));

        let events = Modifier::Field { field, value: None }.apply(&mut c);
        assert_eq!(events.len(), 1);
        assert!(!c.fields.contains_key("age"));
    }

    #[test]
    fn ticket_close_then_reopen() {
        let mut c = contact();
        let uuid = TicketUUID::new();
        c.tickets.push(FlowTicket {
            uuid,
            status: TicketStatus::Open,
            topic: Some(TopicRef {
                uuid: TopicUUID::new(),
                name: "General".to_string(),
            }),
            assignee: None,
        });
        let closed = Modifier::TicketClose {
            ticket_uuids: vec![uuid],
        }
        .apply(&mut c);
        assert_eq!(closed[0].type_name(), "ticket_closed");
        assert!(
            Modifier::TicketClose {
                ticket_uuids: vec![uuid]
            }
            .apply(&mut c)
            .is_empty()
        );

        let reopened = Modifier::TicketReopen {
            ticket_uuids: vec![uuid],
        }
        .apply(&mut c);
        assert_eq!(reopened[0].type_name(), "ticket_reopened");
    }
}
