//! Twilio and TwiML-compatible providers.
//!
//! Calls are requested over the provider's REST API; callbacks are answered
//! with TwiML documents. Requests are signed with HMAC-SHA1 over the callback
//! URL and the sorted form values, keyed by the channel's auth token.

use std::collections::BTreeMap;
use std::io::Cursor;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use hmac::{Hmac, Mac};
use mailroom_flows::{DialStatus, Event, EventKind, MsgOut, Session, WaitHint, WaitKind};
use mailroom_models::{CONFIG_CALL_TIMEOUT, CallError, CallStatus, Channel, URN};
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event as XmlEvent};
use serde::Deserialize;
use sha1::Sha1;

use super::{
    CallCallbacks, CallbackRequest, IvrError, IvrResult, IvrResume, Media, PROVIDER_TIMEOUT,
    Service, StatusUpdate,
};

pub const TWILIO_CHANNEL_TYPE: &str = "T";
pub const TWIML_API_CHANNEL_TYPE: &str = "TW";

pub const CONFIG_ACCOUNT_SID: &str = "account_sid";
pub const CONFIG_AUTH_TOKEN: &str = "auth_token";
pub const CONFIG_BASE_URL: &str = "base_url";

pub const SIGNATURE_HEADER: &str = "X-Twilio-Signature";

const DEFAULT_BASE_URL: &str = "https://api.twilio.com";
const DEFAULT_GATHER_TIMEOUT: i64 = 30;
const MAX_RECORDING_SECONDS: i64 = 600;
const ERROR_PROMPT: &str = "An error has occurred, please try again later.";

type HmacSha1 = Hmac<Sha1>;

fn xml_err(err: impl std::fmt::Display) -> IvrError {
    IvrError::Xml(err.to_string())
}

/// A TwiML verb.
#[derive(Debug, Clone, PartialEq)]
pub enum Verb {
    Say { text: String, language: Option<&'static str> },
    Play { url: String },
    Gather { action: String, timeout: i64, prompts: Vec<Verb> },
    Record { action: String, max_length: i64 },
    Dial { action: String, number: String, timeout: i64, time_limit: i64 },
    Redirect { url: String },
    Hangup,
    Reject { reason: &'static str },
}

impl Verb {
    fn write(&self, w: &mut Writer<Cursor<Vec<u8>>>) -> IvrResult<()> {
        match self {
            Self::Say { text, language } => {
                let mut start = BytesStart::new("Say");
                if let Some(language) = language {
                    start.push_attribute(("language", *language));
                }
                write_text_element(w, start, text)
            }
            Self::Play { url } => write_text_element(w, BytesStart::new("Play"), url),
            Self::Gather { action, timeout, prompts } => {
                let timeout = timeout.to_string();
                let start = BytesStart::new("Gather").with_attributes([
                    ("action", action.as_str()),
                    ("method", "POST"),
                    ("timeout", timeout.as_str()),
                ]);
                w.write_event(XmlEvent::Start(start)).map_err(xml_err)?;
                for prompt in prompts {
                    prompt.write(w)?;
                }
                w.write_event(XmlEvent::End(BytesEnd::new("Gather")))
                    .map_err(xml_err)
            }
            Self::Record { action, max_length } => {
                let max_length = max_length.to_string();
                let start = BytesStart::new("Record").with_attributes([
                    ("action", action.as_str()),
                    ("method", "POST"),
                    ("maxLength", max_length.as_str()),
                ]);
                w.write_event(XmlEvent::Empty(start)).map_err(xml_err)
            }
            Self::Dial { action, number, timeout, time_limit } => {
                let timeout = timeout.to_string();
                let time_limit = time_limit.to_string();
                let start = BytesStart::new("Dial").with_attributes([
                    ("action", action.as_str()),
                    ("method", "POST"),
                    ("timeout", timeout.as_str()),
                    ("timeLimit", time_limit.as_str()),
                ]);
                write_text_element(w, start, number)
            }
            Self::Redirect { url } => {
                let start = BytesStart::new("Redirect").with_attributes([("method", "POST")]);
                write_text_element(w, start, url)
            }
            Self::Hangup => w
                .write_event(XmlEvent::Empty(BytesStart::new("Hangup")))
                .map_err(xml_err),
            Self::Reject { reason } => {
                let start = BytesStart::new("Reject").with_attributes([("reason", *reason)]);
                w.write_event(XmlEvent::Empty(start)).map_err(xml_err)
            }
        }
    }
}

fn write_text_element(
    w: &mut Writer<Cursor<Vec<u8>>>,
    start: BytesStart<'_>,
    text: &str,
) -> IvrResult<()> {
    let end = start.to_end().into_owned();
    w.write_event(XmlEvent::Start(start)).map_err(xml_err)?;
    w.write_event(XmlEvent::Text(BytesText::new(text)))
        .map_err(xml_err)?;
    w.write_event(XmlEvent::End(end)).map_err(xml_err)
}

/// Render a TwiML document, with an optional leading comment.
pub fn render(comment: Option<&str>, verbs: &[Verb]) -> IvrResult<String> {
    let mut w = Writer::new(Cursor::new(Vec::new()));
    w.write_event(XmlEvent::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .map_err(xml_err)?;
    w.write_event(XmlEvent::Start(BytesStart::new("Response")))
        .map_err(xml_err)?;
    if let Some(comment) = comment {
        w.write_event(XmlEvent::Comment(BytesText::new(comment)))
            .map_err(xml_err)?;
    }
    for verb in verbs {
        verb.write(&mut w)?;
    }
    w.write_event(XmlEvent::End(BytesEnd::new("Response")))
        .map_err(xml_err)?;
    String::from_utf8(w.into_inner().into_inner()).map_err(xml_err)
}

/// Provider voice language for one of our three-letter languages.
fn say_language(locale: Option<&str>) -> Option<&'static str> {
    let language = locale?.split(['-', '_']).next()?;
    match language {
        "eng" => Some("en-US"),
        "spa" => Some("es-ES"),
        "fra" => Some("fr-FR"),
        "por" => Some("pt-BR"),
        "deu" => Some("de-DE"),
        "ita" => Some("it-IT"),
        "ara" => Some("ar-XA"),
        _ => None,
    }
}

/// Play the message's audio if it has any, else say its text.
fn prompt_for(msg: &MsgOut) -> Verb {
    let audio = msg.attachments.iter().find_map(|a| {
        let (content_type, url) = a.split_once(':')?;
        content_type.starts_with("audio").then(|| url.to_string())
    });
    match audio {
        Some(url) => Verb::Play { url },
        None => Verb::Say {
            text: msg.text.clone(),
            language: say_language(msg.locale.as_deref()),
        },
    }
}

fn with_param(url: &str, params: &str) -> String {
    let sep = if url.contains('?') { '&' } else { '?' };
    format!("{url}{sep}{params}")
}

/// Signature a provider sends for a callback: base64 HMAC-SHA1 of the URL
/// followed by each form key and value, keys in sorted order.
pub fn request_signature(
    auth_token: &str,
    url: &str,
    form: &BTreeMap<String, String>,
) -> IvrResult<String> {
    Ok(BASE64.encode(signing_mac(auth_token, url, form)?.finalize().into_bytes()))
}

fn signing_mac(
    auth_token: &str,
    url: &str,
    form: &BTreeMap<String, String>,
) -> IvrResult<HmacSha1> {
    let mut mac = HmacSha1::new_from_slice(auth_token.as_bytes())
        .map_err(|e| IvrError::Provider(e.to_string()))?;
    mac.update(url.as_bytes());
    for (key, value) in form {
        mac.update(key.as_bytes());
        mac.update(value.as_bytes());
    }
    Ok(mac)
}

#[derive(Debug, Deserialize)]
struct CallCreated {
    sid: String,
}

/// Service for Twilio and channels speaking its API.
pub struct TwimlService {
    client: reqwest::Client,
}

impl Default for TwimlService {
    fn default() -> Self {
        Self::new()
    }
}

impl TwimlService {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(PROVIDER_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { client }
    }

    fn credentials<'c>(&self, channel: &'c Channel) -> IvrResult<(&'c str, &'c str)> {
        let sid = channel
            .config_str(CONFIG_ACCOUNT_SID)
            .ok_or_else(|| IvrError::Provider("channel has no account SID".to_string()))?;
        let token = channel
            .config_str(CONFIG_AUTH_TOKEN)
            .ok_or_else(|| IvrError::Provider("channel has no auth token".to_string()))?;
        Ok((sid, token))
    }

    fn calls_url(&self, channel: &Channel, sid: &str, path: &str) -> String {
        let base = channel
            .config_str(CONFIG_BASE_URL)
            .unwrap_or(DEFAULT_BASE_URL)
            .trim_end_matches('/');
        format!("{base}/2010-04-01/Accounts/{sid}/Calls{path}.json")
    }

    /// POST a form to the provider and return the response body.
    async fn post_form(
        &self,
        channel: &Channel,
        url: &str,
        form: &[(&str, &str)],
    ) -> IvrResult<String> {
        let (sid, token) = self.credentials(channel)?;
        let body = reqwest::Url::parse_with_params("http://form.invalid/", form)
            .map_err(|e| IvrError::Provider(e.to_string()))?
            .query()
            .unwrap_or_default()
            .to_string();
        let resp = self
            .client
            .post(url)
            .basic_auth(sid, Some(token))
            .header(reqwest::header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(IvrError::Provider(format!("{status}: {body}")));
        }
        Ok(body)
    }
}

#[async_trait::async_trait]
impl Service for TwimlService {
    async fn request_call(
        &self,
        channel: &Channel,
        urn: &URN,
        callbacks: &CallCallbacks,
    ) -> IvrResult<String> {
        let (sid, _) = self.credentials(channel)?;
        let timeout = channel
            .config_int(CONFIG_CALL_TIMEOUT)
            .unwrap_or(60)
            .to_string();
        let form = [
            ("To", urn.path()),
            ("From", channel.address.as_str()),
            ("Url", callbacks.start_url.as_str()),
            ("StatusCallback", callbacks.status_url.as_str()),
            ("MachineDetection", "Enable"),
            ("Timeout", timeout.as_str()),
        ];
        let body = self
            .post_form(channel, &self.calls_url(channel, sid, ""), &form)
            .await?;
        let created: CallCreated = serde_json::from_str(&body)?;
        Ok(created.sid)
    }

    async fn hangup_call(&self, channel: &Channel, external_id: &str) -> IvrResult<()> {
        let (sid, _) = self.credentials(channel)?;
        let url = self.calls_url(channel, sid, &format!("/{external_id}"));
        self.post_form(channel, &url, &[("Status", "completed")])
            .await?;
        Ok(())
    }

    fn write_session_response(
        &self,
        session: &Session,
        events: &[Event],
        resume_url: &str,
    ) -> IvrResult<String> {
        let mut prompts = Vec::new();
        let mut dial = None;
        for event in events {
            match &event.kind {
                EventKind::IvrCreated { msg } => prompts.push(prompt_for(msg)),
                EventKind::DialWait { urn, dial_limit_seconds, call_limit_seconds, .. } => {
                    dial = Some((urn.path().to_string(), *dial_limit_seconds, *call_limit_seconds));
                }
                _ => {}
            }
        }

        let Some(wait) = &session.wait else {
            prompts.push(Verb::Hangup);
            return render(None, &prompts);
        };
        match (wait.kind, wait.hint) {
            (WaitKind::Msg, Some(WaitHint::Audio)) => {
                let action = with_param(resume_url, "wait_type=record");
                prompts.push(Verb::Record {
                    action: action.clone(),
                    max_length: MAX_RECORDING_SECONDS,
                });
                prompts.push(Verb::Redirect {
                    url: with_param(&action, "empty=true"),
                });
                render(None, &prompts)
            }
            (WaitKind::Msg, _) => {
                let action = with_param(resume_url, "wait_type=gather");
                let timeout = wait
                    .timeout_on
                    .map(|t| (t - Utc::now()).num_seconds().max(1))
                    .unwrap_or(DEFAULT_GATHER_TIMEOUT);
                let verbs = [
                    Verb::Gather {
                        action: action.clone(),
                        timeout,
                        prompts,
                    },
                    Verb::Redirect {
                        url: with_param(&action, "timeout=true"),
                    },
                ];
                render(None, &verbs)
            }
            (WaitKind::Dial, _) => {
                let Some((number, timeout, time_limit)) = dial else {
                    return Err(IvrError::BadRequest("dial wait without a dial event".to_string()));
                };
                prompts.push(Verb::Dial {
                    action: with_param(resume_url, "wait_type=dial"),
                    number,
                    timeout,
                    time_limit,
                });
                render(None, &prompts)
            }
        }
    }

    fn write_reject_response(&self) -> IvrResult<String> {
        render(Some("rejecting call"), &[Verb::Reject { reason: "rejected" }])
    }

    fn write_error_response(&self, err: &str) -> IvrResult<String> {
        let verbs = [
            Verb::Say {
                text: ERROR_PROMPT.to_string(),
                language: None,
            },
            Verb::Hangup,
        ];
        render(Some(err), &verbs)
    }

    fn write_empty_response(&self, msg: &str) -> IvrResult<String> {
        render(Some(msg), &[Verb::Hangup])
    }

    fn resume_for_request(&self, req: &CallbackRequest) -> IvrResult<IvrResume> {
        match req.param("wait_type") {
            Some("gather") => {
                if req.param("timeout") == Some("true") {
                    return Ok(IvrResume::Timeout);
                }
                Ok(match req.param("Digits") {
                    Some(digits) => IvrResume::Input {
                        digits: digits.to_string(),
                    },
                    None => IvrResume::Timeout,
                })
            }
            Some("record") => Ok(match req.param("RecordingUrl") {
                Some(url) if !url.is_empty() => IvrResume::Recording {
                    url: url.to_string(),
                },
                _ => IvrResume::Timeout,
            }),
            Some("dial") => {
                let status = match req.param("DialCallStatus") {
                    Some("completed" | "answered") => DialStatus::Answered,
                    Some("busy") => DialStatus::Busy,
                    Some("no-answer") => DialStatus::NoAnswer,
                    _ => DialStatus::Failed,
                };
                let duration = req
                    .param("DialCallDuration")
                    .and_then(|d| d.parse().ok())
                    .unwrap_or(0);
                Ok(IvrResume::Dial { status, duration })
            }
            Some(other) => Err(IvrError::BadRequest(format!("unknown wait_type {other}"))),
            None => Err(IvrError::BadRequest("missing wait_type".to_string())),
        }
    }

    fn status_for_request(&self, req: &CallbackRequest) -> StatusUpdate {
        let duration = req
            .param("CallDuration")
            .and_then(|d| d.parse().ok())
            .unwrap_or(0);
        let (status, error) = match req.param("CallStatus") {
            Some("queued" | "ringing") => (CallStatus::Wired, None),
            Some("in-progress" | "answered") => (CallStatus::InProgress, None),
            Some("completed") => (CallStatus::Completed, None),
            Some("busy") => (CallStatus::Errored, Some(CallError::Busy)),
            Some("no-answer") => (CallStatus::Errored, Some(CallError::NoAnswer)),
            _ => (CallStatus::Failed, None),
        };
        StatusUpdate {
            status,
            error,
            duration,
        }
    }

    fn check_start_request(&self, req: &CallbackRequest) -> Option<CallError> {
        match req.param("AnsweredBy") {
            Some(answered_by) if answered_by.starts_with("machine_") || answered_by == "fax" => {
                Some(CallError::Machine)
            }
            _ => None,
        }
    }

    fn preprocess_resume(&self, req: &CallbackRequest) -> IvrResult<Option<String>> {
        // the caller hung up while we were waiting on them
        if req.param("CallStatus") == Some("completed") && req.param("wait_type").is_none() {
            return self.write_empty_response("call completed").map(Some);
        }
        Ok(None)
    }

    fn validate_request_signature(&self, channel: &Channel, req: &CallbackRequest) -> IvrResult<()> {
        let token = channel
            .config_str(CONFIG_AUTH_TOKEN)
            .ok_or(IvrError::InvalidSignature)?;
        let given = req
            .signature
            .as_deref()
            .and_then(|s| BASE64.decode(s).ok())
            .ok_or(IvrError::InvalidSignature)?;
        signing_mac(token, &req.url, &req.form)?
            .verify_slice(&given)
            .map_err(|_| IvrError::InvalidSignature)
    }

    async fn download_media(&self, channel: &Channel, url: &str) -> IvrResult<Media> {
        let (sid, token) = self.credentials(channel)?;
        let resp = self
            .client
            .head(url)
            .basic_auth(sid, Some(token))
            .send()
            .await?
            .error_for_status()?;
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("audio/x-wav")
            .to_string();
        Ok(Media {
            content_type,
            url: url.to_string(),
        })
    }

    fn urn_for_request(&self, req: &CallbackRequest) -> IvrResult<URN> {
        let from = req
            .param("From")
            .ok_or_else(|| IvrError::BadRequest("missing From".to_string()))?;
        URN::new("tel", from, None).map_err(|e| IvrError::BadRequest(e.to_string()))
    }

    fn call_id_for_request(&self, req: &CallbackRequest) -> IvrResult<String> {
        req.param("CallSid")
            .map(str::to_string)
            .ok_or_else(|| IvrError::BadRequest("missing CallSid".to_string()))
    }

    fn redact_values(&self, channel: &Channel) -> Vec<String> {
        channel
            .config_str(CONFIG_AUTH_TOKEN)
            .map(|t| vec![t.to_string()])
            .unwrap_or_default()
    }

    fn content_type(&self) -> &'static str {
        "text/xml"
    }
}
