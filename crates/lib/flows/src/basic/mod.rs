//! A small engine interpreting the node subset described in [`definition`]:
//! message, voice and contact actions, and switch routers that optionally wait
//! for a message or dial result.

pub mod definition;

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use mailroom_models::{
    CallUUID, ExitUUID, Flow, FlowType, MsgUUID, NodeUUID, RunStatus, RunUUID, SessionStatus, SessionUUID,
    StepUUID, TicketStatus, TicketUUID, URN,
};

use self::definition::{ActionKind, Definition, Node, Router};
use crate::{
    EngineError, EngineResult, Event, EventKind, FlowContact, FlowEngine, FlowTicket, GroupModification, Modifier, MsgIn, MsgOut, Resume, Run, RunResult, Segment,
    Session, SessionAssets, Sprint, Step, Trigger, Wait, WaitKind,
};

/// Default minutes a messaging wait lasts before it expires.
pub const DEFAULT_MSG_EXPIRE_MINUTES: i64 = 7 * 24 * 60;
/// Minutes a voice wait lasts before it expires.
pub const VOICE_EXPIRE_MINUTES: i64 = 5;
/// Days a waiting session lives before it is expired regardless of waits.
pub const SESSION_EXPIRE_DAYS: i64 = 30;

const MAX_STEPS_PER_SPRINT: usize = 100;

#[derive(Debug, Clone, Copy, Default)]
pub struct BasicEngine;

impl BasicEngine {
    pub fn new() -> Self {
        Self
    }
}

fn definition(flow: &Flow) -> EngineResult<Definition> {
    serde_json::from_value(flow.definition.clone())
        .map_err(|err| EngineError::InvalidDefinition(flow.uuid, err.to_string()))
}

#[async_trait::async_trait]
impl FlowEngine for BasicEngine {
    async fn start(
        &self,
        assets: &dyn SessionAssets,
        contact: FlowContact,
        trigger: Trigger,
        call: Option<CallUUID>,
    ) -> EngineResult<(Session, Sprint)> {
        let flow_ref = trigger.flow().clone();
        let flow = assets
            .flow_by_uuid(flow_ref.uuid)
            .ok_or(EngineError::FlowNotFound(flow_ref.uuid))?;
        let def = definition(flow)?;
        let now = Utc::now();

        let input = match &trigger {
            Trigger::Msg { msg, .. } => Some(msg.clone()),
            _ => None,
        };
        let mut session = Session {
            uuid: SessionUUID::new(),
            session_type: flow.flow_type,
            status: SessionStatus::Waiting,
            contact,
            trigger,
            runs: Vec::new(),
            wait: None,
            expires_on: None,
            call_uuid: call,
            state: serde_json::Value::Null,
        };
        let mut sprint = Sprint::new();
        if let Some(msg) = &input {
            sprint
                .events
                .push(Event::new(EventKind::MsgReceived { msg: msg.clone() }));
        }

        session.runs.push(Run {
            uuid: RunUUID::new(),
            flow: flow_ref.clone(),
            status: RunStatus::Active,
            path: Vec::new(),
            results: Default::default(),
            responded: input.is_some(),
            created_on: now,
            modified_on: now,
            exited_on: None,
        });
        sprint.events.push(Event::new(EventKind::RunStarted {
            run_uuid: session.runs[0].uuid,
            flow: flow_ref,
        }));

        let mut exec = Execution {
            flow,
            def: &def,
            session: &mut session,
            sprint: &mut sprint,
            input,
            now,
        };
        match def.nodes.first() {
            Some(first) => exec.continue_at(Some(first.uuid)),
            None => exec.continue_at(None),
        }
        debug!(flow = %flow.uuid, events = sprint.events.len(), "started session");
        Ok((session, sprint))
    }

    async fn resume(
        &self,
        assets: &dyn SessionAssets,
        mut session: Session,
        contact: FlowContact,
        resume: Resume,
    ) -> EngineResult<(Session, Sprint)> {
        if session.status != SessionStatus::Waiting {
            return Err(EngineError::NotWaiting(session.status));
        }
        let flow_uuid = session
            .current_run()
            .map(|r| r.flow.uuid)
            .ok_or(EngineError::NotWaiting(session.status))?;
        let flow = assets
            .flow_by_uuid(flow_uuid)
            .ok_or(EngineError::FlowNotFound(flow_uuid))?;
        let def = definition(flow)?;
        let now = Utc::now();
        session.contact = contact;

        let mut sprint = Sprint::new();
        let wait = session.wait.take();
        let node = session
            .current_run()
            .and_then(|r| r.path.last())
            .and_then(|step| def.node(step.node_uuid))
            .ok_or(EngineError::InvalidResume(resume.type_name()))?;
        let router = node
            .router
            .as_ref()
            .ok_or(EngineError::InvalidResume(resume.type_name()))?;

        let mut exec = Execution {
            flow,
            def: &def,
            session: &mut session,
            sprint: &mut sprint,
            input: None,
            now,
        };

        match resume {
            Resume::Msg { msg } => {
                exec.sprint
                    .events
                    .push(Event::new(EventKind::MsgReceived { msg: msg.clone() }));
                if let Some(run) = exec.session.current_run_mut() {
                    run.responded = true;
                }
                exec.input = Some(msg);
                let operand = exec.operand(&router.operand);
                let next = exec.route(node, router, operand);
                exec.continue_at(next);
            }
            Resume::Dial { status, duration } => {
                if wait.as_ref().map(|w| w.kind) != Some(WaitKind::Dial) {
                    return Err(EngineError::InvalidResume("dial"));
                }
                exec.sprint
                    .events
                    .push(Event::new(EventKind::DialEnded { status, duration }));
                let next = exec.route(node, router, Some(status.as_str().to_string()));
                exec.continue_at(next);
            }
            Resume::WaitTimeout {} => {
                let Some(category) = router
                    .wait
                    .as_ref()
                    .and_then(|w| w.timeout_category_uuid)
                    .and_then(|uuid| router.category(uuid))
                else {
                    return Err(EngineError::InvalidResume("wait_timeout"));
                };
                exec.sprint
                    .events
                    .push(Event::new(EventKind::WaitTimedOut {}));
                let next = exec.take_exit(node, category.exit_uuid, None);
                exec.continue_at(next);
            }
            Resume::WaitExpiration {} | Resume::SessionExpiration {} => {
                exec.end_session(SessionStatus::Expired);
            }
        }
        Ok((session, sprint))
    }

    fn contact_matches_query(&self, contact: &FlowContact, query: &str) -> EngineResult<bool> {
        crate::query::matches(contact, query)
    }
}

struct Execution<'a> {
    flow: &'a Flow,
    def: &'a Definition,
    session: &'a mut Session,
    sprint: &'a mut Sprint,
    input: Option<MsgIn>,
    now: DateTime<Utc>,
}

impl Execution<'_> {
    fn run_mut(&mut self) -> &mut Run {
        // a run is always pushed before execution starts
        let idx = self.session.runs.len() - 1;
        &mut self.session.runs[idx]
    }

    fn push(&mut self, kind: EventKind, step: StepUUID) {
        self.sprint.events.push(Event::at_step(kind, step));
    }

    /// Execute nodes from `start` until the flow waits or exits.
    fn continue_at(&mut self, start: Option<NodeUUID>) {
        let def = self.def;
        let mut next = start;
        let mut steps = 0;
        while let Some(node_uuid) = next {
            steps += 1;
            if steps > MAX_STEPS_PER_SPRINT {
                self.fail("too many steps in a single sprint");
                return;
            }
            let Some(node) = def.node(node_uuid) else {
                self.fail(&format!("node {node_uuid} not found"));
                return;
            };
            let step = StepUUID::new();
            let arrived_on = self.now;
            self.run_mut().path.push(Step {
                uuid: step,
                node_uuid,
                exit_uuid: None,
                arrived_on,
            });
            for action in &node.actions {
                self.execute(action, step);
            }

            next = match &node.router {
                Some(router) if router.wait.is_some() => {
                    self.wait(router, step);
                    return;
                }
                Some(router) => {
                    let operand = self.operand(&router.operand);
                    self.route(node, router, operand)
                }
                None => match node.exits.first() {
                    Some(exit) => self.take_exit(node, exit.uuid, None),
                    None => None,
                },
            };
        }
        self.end_session(SessionStatus::Completed);
    }

    fn execute(&mut self, action: &definition::Action, step: StepUUID) {
        let def = self.def;
        let language = self.session.contact.language.clone();
        let localized = |property: &str, fallback: &str| -> String {
            def
                .localized(language.as_deref(), action.uuid, property)
                .and_then(|values| values.first().cloned())
                .unwrap_or_else(|| fallback.to_string())
        };
        match &action.kind {
            ActionKind::SendMsg {
                text,
                attachments,
                quick_replies,
            } => {
                let text = self.template(&localized("text", text));
                let urn = self.session.contact.preferred_urn().cloned();
                let unsendable_reason = urn.is_none().then(|| "no_destination".to_string());
                let msg = MsgOut {
                    uuid: MsgUUID::new(),
                    urn,
                    channel: None,
                    text,
                    attachments: attachments.clone(),
                    quick_replies: quick_replies.clone(),
                    locale: language.clone(),
                    unsendable_reason,
                };
                self.push(EventKind::MsgCreated { msg }, step);
            }
            ActionKind::SayMsg { text } => {
                let text = self.template(&localized("text", text));
                let msg = MsgOut {
                    uuid: MsgUUID::new(),
                    urn: self.session.contact.preferred_urn().cloned(),
                    channel: None,
                    text,
                    attachments: vec![],
                    quick_replies: vec![],
                    locale: language.clone(),
                    unsendable_reason: None,
                };
                self.push(EventKind::IvrCreated { msg }, step);
            }
            ActionKind::SetContactField { field, value } => {
                let value = self.template(value);
                self.modify(
                    Modifier::Field {
                        field: field.clone(),
                        value: Some(value),
                    },
                    step,
                );
            }
            ActionKind::SetContactName { name } => {
                let name = self.template(name);
                self.modify(Modifier::Name { name: Some(name) }, step);
            }
            ActionKind::SetContactLanguage { language } => {
                self.modify(
                    Modifier::Language {
                        language: Some(language.clone()),
                    },
                    step,
                );
            }
            ActionKind::AddContactGroups { groups } => self.modify(
                Modifier::Groups {
                    groups: groups.clone(),
                    modification: GroupModification::Add,
                },
                step,
            ),
            ActionKind::RemoveContactGroups { groups } => self.modify(
                Modifier::Groups {
                    groups: groups.clone(),
                    modification: GroupModification::Remove,
                },
                step,
            ),
            ActionKind::SetRunResult {
                name,
                value,
                category,
            } => {
                let value = self.template(value);
                let node = self.run_mut().path.last().map(|s| s.node_uuid);
                if let Some(node) = node {
                    self.save_result(name, value, category.clone(), node, step);
                }
            }
            ActionKind::OpenTicket {
                topic,
                assignee,
                note,
            } => {
                if self
                    .session
                    .contact
                    .tickets
                    .iter()
                    .any(|t| t.status == TicketStatus::Open)
                {
                    return;
                }
                let note = note.as_deref().map(|n| self.template(n));
                let ticket_uuid = TicketUUID::new();
                self.session.contact.tickets.push(FlowTicket {
                    uuid: ticket_uuid,
                    status: TicketStatus::Open,
                    topic: topic.clone(),
                    assignee: assignee.clone(),
                });
                self.push(
                    EventKind::TicketOpened {
                        ticket_uuid,
                        topic: topic.clone(),
                        assignee: assignee.clone(),
                        note,
                    },
                    step,
                );
            }
            ActionKind::AddInputLabels { labels } => {
                let input_uuid = self.input.as_ref().map(|m| m.uuid);
                if input_uuid.is_some() {
                    self.push(
                        EventKind::InputLabelsAdded {
                            input_uuid,
                            labels: labels.clone(),
                        },
                        step,
                    );
                }
            }
            ActionKind::SendBroadcast {
                translations,
                base_language,
                groups,
                contacts,
                urns,
            } => self.push(
                EventKind::BroadcastCreated {
                    translations: translations.clone(),
                    base_language: base_language.clone(),
                    groups: groups.clone(),
                    contacts: contacts.clone(),
                    urns: urns.clone(),
                    contact_query: None,
                },
                step,
            ),
        }
    }

    fn modify(&mut self, modifier: Modifier, step: StepUUID) {
        for mut event in modifier.apply(&mut self.session.contact) {
            event.step_uuid = Some(step);
            self.sprint.events.push(event);
        }
    }

    fn save_result(
        &mut self,
        name: &str,
        value: String,
        category: Option<String>,
        node_uuid: NodeUUID,
        step: StepUUID,
    ) {
        let key = snakify(name);
        let input = self.input.as_ref().map(|m| m.text.clone());
        let now = self.now;
        let run = self.run_mut();
        let previous_category = run.results.get(&key).and_then(|r| r.category.clone());
        run.results.insert(
            key,
            RunResult {
                name: name.to_string(),
                value: value.clone(),
                category: category.clone(),
                node_uuid,
                input,
                created_on: now,
            },
        );
        run.modified_on = now;
        self.push(
            EventKind::RunResultChanged {
                name: name.to_string(),
                value,
                category,
                previous_category,
            },
            step,
        );
    }

    fn wait(&mut self, router: &Router, step: StepUUID) {
        let Some(wait) = &router.wait else {
            return;
        };
        let expire_minutes = match self.session.session_type {
            FlowType::Voice => VOICE_EXPIRE_MINUTES,
            _ => self
                .def
                .expire_after_minutes
                .unwrap_or(DEFAULT_MSG_EXPIRE_MINUTES),
        };
        let expires_on = Some(self.now + Duration::minutes(expire_minutes));
        let timeout_on = wait
            .timeout_seconds
            .filter(|_| wait.timeout_category_uuid.is_some())
            .map(|secs| self.now + Duration::seconds(secs));

        match wait.kind {
            WaitKind::Msg => self.push(
                EventKind::MsgWait {
                    timeout_seconds: wait.timeout_seconds,
                    expires_on,
                },
                step,
            ),
            WaitKind::Dial => {
                let urn = wait
                    .phone
                    .as_deref()
                    .and_then(|phone| URN::new("tel", phone, None).ok());
                let Some(urn) = urn else {
                    self.fail("dial wait without a valid phone number");
                    return;
                };
                self.push(
                    EventKind::DialWait {
                        urn,
                        dial_limit_seconds: 60,
                        call_limit_seconds: 3600,
                        expires_on,
                    },
                    step,
                );
            }
        }

        self.session.wait = Some(Wait {
            kind: wait.kind,
            expires_on,
            timeout_on,
            hint: wait.hint,
        });
        self.session.expires_on = Some(self.now + Duration::days(SESSION_EXPIRE_DAYS));
        self.session.status = SessionStatus::Waiting;
        let now = self.now;
        let run = self.run_mut();
        run.status = RunStatus::Waiting;
        run.modified_on = now;
    }

    /// Pick a category for the operand, save the result, and take its exit.
    fn route(&mut self, node: &Node, router: &Router, operand: Option<String>) -> Option<NodeUUID> {
        let text = operand.clone().unwrap_or_default();
        let category_uuid = router
            .cases
            .iter()
            .find(|case| evaluate_case(&case.test, &case.arguments, &text))
            .map(|case| case.category_uuid)
            .or(router.default_category_uuid);
        let Some(category) = category_uuid.and_then(|uuid| router.category(uuid)) else {
            self.fail(&format!("no category matched on node {}", node.uuid));
            return None;
        };

        let step = self
            .session
            .runs
            .last()
            .and_then(|r| r.path.last())
            .map(|s| s.uuid)
            .unwrap_or_else(StepUUID::new);
        if let Some(name) = &router.result_name {
            self.save_result(name, text, Some(category.name.clone()), node.uuid, step);
        }
        self.take_exit(node, category.exit_uuid, operand)
    }

    fn take_exit(
        &mut self,
        node: &Node,
        exit_uuid: ExitUUID,
        operand: Option<String>,
    ) -> Option<NodeUUID> {
        let now = self.now;
        let flow_uuid = self.flow.uuid;
        if let Some(step) = self.run_mut().path.last_mut() {
            step.exit_uuid = Some(exit_uuid);
        }
        let destination = node.exit(exit_uuid).and_then(|e| e.destination_uuid)?;
        self.sprint.segments.push(Segment {
            flow_uuid,
            node_uuid: node.uuid,
            exit_uuid,
            destination_uuid: destination,
            operand,
            time: now,
        });
        Some(destination)
    }

    fn fail(&mut self, reason: &str) {
        self.sprint.events.push(Event::new(EventKind::Failure {
            text: reason.to_string(),
        }));
        self.end_session(SessionStatus::Failed);
    }

    fn end_session(&mut self, status: SessionStatus) {
        let now = self.now;
        let run_status = RunStatus::from(status);
        let mut ended = Vec::new();
        for run in self.session.runs.iter_mut().filter(|r| !r.status.is_ended()) {
            run.end(run_status, now);
            ended.push((run.uuid, run.flow.clone()));
        }
        for (run_uuid, flow) in ended {
            self.sprint.events.push(Event::new(EventKind::RunEnded {
                run_uuid,
                flow,
                status: run_status,
            }));
        }
        self.session.status = status;
        self.session.wait = None;
        self.session.expires_on = None;
    }

    fn operand(&self, expression: &str) -> Option<String> {
        let expression = expression.trim();
        match expression.strip_prefix('@') {
            Some(path) => self.resolve(path),
            None => Some(expression.to_string()),
        }
    }

    fn resolve(&self, path: &str) -> Option<String> {
        let (root, rest) = path.split_once('.').unwrap_or((path, ""));
        match root {
            "input" => self.input.as_ref().map(|m| m.text.clone()),
            "contact" if rest.is_empty() => self.session.contact.name.clone(),
            "contact" => self.session.contact.value_of(rest),
            "fields" => self.session.contact.value_of(rest),
            "results" => {
                let (key, prop) = rest.split_once('.').unwrap_or((rest, ""));
                let result = self.session.runs.last()?.results.get(key)?;
                match prop {
                    "value" => Some(result.value.clone()),
                    _ => result.category.clone().or_else(|| Some(result.value.clone())),
                }
            }
            _ => None,
        }
    }

    /// Replace `@root.path` references in text, leaving unknown ones as written.
    fn template(&self, text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        let mut chars = text.char_indices().peekable();
        while let Some((i, c)) = chars.next() {
            if c != '@' {
                out.push(c);
                continue;
            }
            let mut end = i + 1;
            while let Some(&(j, next)) = chars.peek() {
                if next.is_alphanumeric() || next == '_' || next == '.' {
                    end = j + next.len_utf8();
                    chars.next();
                } else {
                    break;
                }
            }
            let token = &text[i + 1..end];
            let trimmed = token.trim_end_matches('.');
            match self.resolve(trimmed) {
                Some(value) if !trimmed.is_empty() => {
                    out.push_str(&value);
                    out.push_str(&token[trimmed.len()..]);
                }
                _ => {
                    out.push('@');
                    out.push_str(token);
                }
            }
        }
        out
    }
}

fn words(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn evaluate_case(test: &str, arguments: &[String], text: &str) -> bool {
    let arg = |i: usize| arguments.get(i).map(String::as_str).unwrap_or_default();
    let input = words(text);
    match test {
        "has_any_word" => words(arg(0)).iter().any(|w| input.contains(w)),
        "has_all_words" => {
            let expected = words(arg(0));
            !expected.is_empty() && expected.iter().all(|w| input.contains(w))
        }
        "has_phrase" => {
            let phrase = words(arg(0)).join(" ");
            !phrase.is_empty() && input.join(" ").contains(&phrase)
        }
        "has_only_phrase" | "has_only_text" => words(arg(0)) == input,
        "has_beginning" => text
            .trim()
            .to_lowercase()
            .starts_with(&arg(0).trim().to_lowercase()),
        "has_text" => !text.trim().is_empty(),
        "has_number" => text.trim().parse::<f64>().is_ok(),
        "has_number_between" => {
            let (Ok(n), Ok(min), Ok(max)) = (
                text.trim().parse::<f64>(),
                arg(0).parse::<f64>(),
                arg(1).parse::<f64>(),
            ) else {
                return false;
            };
            n >= min && n <= max
        }
        "has_dial_status" | "is_text_eq" => text.trim().eq_ignore_ascii_case(arg(0).trim()),
        _ => false,
    }
}

/// Result key for a result name: lowercase with runs of other characters as `_`.
pub fn snakify(name: &str) -> String {
    let mut key = String::new();
    for c in name.trim().chars() {
        if c.is_alphanumeric() {
            key.extend(c.to_lowercase());
        } else if !key.ends_with('_') {
            key.push('_');
        }
    }
    key.trim_matches('_').to_string()
}
