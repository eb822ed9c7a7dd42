//! Trigger matching.
//!
//! Several triggers can match the same input; the most specific wins. A
//! trigger restricted to a channel beats one restricted to included groups,
//! which beats one restricted by excluded groups, which beats an
//! unrestricted one. Among equally specific triggers the first one wins.

use mailroom_models::{
    ChannelEventType, ChannelID, Contact, KeywordMatchType, Trigger, TriggerType,
};

use crate::assets::OrgAssets;

/// Key in channel event extras carrying a referral's id.
pub const EXTRA_REFERRER_ID: &str = "referrer_id";

/// A trigger together with the keyword that matched it, if any.
#[derive(Debug, Clone, Copy)]
pub struct TriggerMatch<'a> {
    pub trigger: &'a Trigger,
    pub keyword: Option<&'a str>,
}

/// Lowercased words of a message, split on anything that isn't alphanumeric.
pub fn words(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn specificity(trigger: &Trigger) -> u8 {
    let mut score = 0;
    if trigger.channel_id.is_some() {
        score += 4;
    }
    if !trigger.include_group_ids.is_empty() {
        score += 2;
    }
    if !trigger.exclude_group_ids.is_empty() {
        score += 1;
    }
    score
}

fn applies_to(trigger: &Trigger, channel_id: Option<ChannelID>, contact: &Contact) -> bool {
    if trigger.channel_id.is_some() && trigger.channel_id != channel_id {
        return false;
    }
    if !trigger.include_group_ids.is_empty()
        && !trigger.include_group_ids.iter().any(|g| contact.in_group(*g))
    {
        return false;
    }
    !trigger.exclude_group_ids.iter().any(|g| contact.in_group(*g))
}

fn most_specific<'a>(candidates: impl Iterator<Item = TriggerMatch<'a>>) -> Option<TriggerMatch<'a>> {
    let mut best: Option<TriggerMatch<'a>> = None;
    for candidate in candidates {
        match &best {
            Some(current) if specificity(current.trigger) >= specificity(candidate.trigger) => {}
            _ => best = Some(candidate),
        }
    }
    best
}

fn keyword_matches<'a>(trigger: &'a Trigger, words: &[String]) -> Option<&'a str> {
    let first = words.first()?;
    let only_word = trigger.match_type == Some(KeywordMatchType::OnlyWord);
    if only_word && words.len() != 1 {
        return None;
    }
    trigger
        .keywords
        .iter()
        .find(|k| k.to_lowercase() == *first)
        .map(String::as_str)
}

/// Match an incoming message against keyword triggers, falling back to
/// catch-all triggers when `catchall` is set.
pub fn match_msg<'a>(
    triggers: &'a [Trigger],
    channel_id: Option<ChannelID>,
    contact: &Contact,
    text: &str,
    catchall: bool,
) -> Option<TriggerMatch<'a>> {
    let words = words(text);
    let keyword = most_specific(
        triggers
            .iter()
            .filter(|t| t.trigger_type == TriggerType::Keyword)
            .filter(|t| applies_to(t, channel_id, contact))
            .filter_map(|t| {
                keyword_matches(t, &words).map(|keyword| TriggerMatch {
                    trigger: t,
                    keyword: Some(keyword),
                })
            }),
    );
    if keyword.is_some() || !catchall {
        return keyword;
    }
    most_specific(
        triggers
            .iter()
            .filter(|t| t.trigger_type == TriggerType::Catchall)
            .filter(|t| applies_to(t, channel_id, contact))
            .map(|trigger| TriggerMatch {
                trigger,
                keyword: None,
            }),
    )
}

/// The trigger type a channel event fires, if any.
pub fn trigger_type_for(event_type: ChannelEventType) -> Option<TriggerType> {
    match event_type {
        ChannelEventType::NewConversation => Some(TriggerType::NewConversation),
        ChannelEventType::Referral => Some(TriggerType::Referral),
        ChannelEventType::MissedCall => Some(TriggerType::MissedCall),
        ChannelEventType::IncomingCall => Some(TriggerType::IncomingCall),
        ChannelEventType::OptIn => Some(TriggerType::OptIn),
        ChannelEventType::OptOut => Some(TriggerType::OptOut),
        ChannelEventType::StopContact
        | ChannelEventType::WelcomeMessage
        | ChannelEventType::DeleteContact => None,
    }
}

/// Match a channel event. Referral triggers with a referrer id only match
/// that referrer; ones without match any referral.
pub fn match_channel_event<'a>(
    triggers: &'a [Trigger],
    event_type: ChannelEventType,
    channel_id: ChannelID,
    contact: &Contact,
    referrer_id: Option<&str>,
) -> Option<TriggerMatch<'a>> {
    let trigger_type = trigger_type_for(event_type)?;
    let candidates = triggers
        .iter()
        .filter(|t| t.trigger_type == trigger_type)
        .filter(|t| applies_to(t, Some(channel_id), contact))
        .filter(|t| match (&t.referrer_id, trigger_type) {
            (Some(wanted), TriggerType::Referral) => {
                referrer_id.is_some_and(|r| r.eq_ignore_ascii_case(wanted))
            }
            _ => true,
        });

    // a referral trigger naming the referrer beats a generic one
    let exact = candidates
        .clone()
        .filter(|t| t.referrer_id.is_some() && trigger_type == TriggerType::Referral);
    let found = most_specific(exact.map(|trigger| TriggerMatch {
        trigger,
        keyword: None,
    }));
    found.or_else(|| {
        most_specific(candidates.map(|trigger| TriggerMatch {
            trigger,
            keyword: None,
        }))
    })
}

pub fn match_ticket_closed<'a>(triggers: &'a [Trigger], contact: &Contact) -> Option<&'a Trigger> {
    most_specific(
        triggers
            .iter()
            .filter(|t| t.trigger_type == TriggerType::TicketClosed)
            .filter(|t| applies_to(t, None, contact))
            .map(|trigger| TriggerMatch {
                trigger,
                keyword: None,
            }),
    )
    .map(|m| m.trigger)
}

/// Message triggers of an org whose flows are still usable.
pub fn find_msg_trigger<'a>(
    assets: &'a OrgAssets,
    channel_id: Option<ChannelID>,
    contact: &Contact,
    text: &str,
    catchall: bool,
) -> Option<TriggerMatch<'a>> {
    match_msg(assets.triggers(), channel_id, contact, text, catchall)
        .filter(|m| flow_usable(assets, m.trigger))
}

pub fn find_channel_trigger<'a>(
    assets: &'a OrgAssets,
    event_type: ChannelEventType,
    channel_id: ChannelID,
    contact: &Contact,
    referrer_id: Option<&str>,
) -> Option<TriggerMatch<'a>> {
    match_channel_event(assets.triggers(), event_type, channel_id, contact, referrer_id)
        .filter(|m| flow_usable(assets, m.trigger))
}

pub fn find_ticket_closed_trigger<'a>(
    assets: &'a OrgAssets,
    contact: &Contact,
) -> Option<&'a Trigger> {
    match_ticket_closed(assets.triggers(), contact).filter(|t| flow_usable(assets, t))
}

fn flow_usable(assets: &OrgAssets, trigger: &Trigger) -> bool {
    assets
        .flow_by_id(trigger.flow_id)
        .is_some_and(|flow| flow.is_active)
}

#[cfg(test)]
mod tests {
    use mailroom_models::{FlowID, GroupID, OrgID, TriggerID};

    use super::*;
    use crate::test_support::{self, ANN, BOB, DOCTORS, TWILIO};

    fn trigger(id: i64, trigger_type: TriggerType, keywords: &[&str]) -> Trigger {
        Trigger {
            id: TriggerID(id),
            org_id: OrgID(1),
            trigger_type,
            flow_id: FlowID(id),
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            match_type: Some(KeywordMatchType::FirstWord),
            channel_id: None,
            referrer_id: None,
            include_group_ids: vec![],
            exclude_group_ids: vec![],
        }
    }

    #[test]
    fn test_words_split_and_lowercase() {
        assert_eq!(words("  Join, NOW!"), vec!["join", "now"]);
        assert!(words("...").is_empty());
    }

    #[tokio::test]
    async fn test_keyword_match_types() {
        let fx = test_support::fixture().await;
        let ann = fx.mem.contact(ANN).unwrap();
        let mut only = trigger(2, TriggerType::Keyword, &["stop"]);
        only.match_type = Some(KeywordMatchType::OnlyWord);
        let triggers = vec![trigger(1, TriggerType::Keyword, &["Join"]), only];

        let m = match_msg(&triggers, None, &ann, "join the club", false).unwrap();
        assert_eq!(m.trigger.id, TriggerID(1));
        assert_eq!(m.keyword, Some("Join"));

        assert!(match_msg(&triggers, None, &ann, "please join", false).is_none());
        assert!(match_msg(&triggers, None, &ann, "stop it", false).is_none());
        assert_eq!(
            match_msg(&triggers, None, &ann, "STOP", false).unwrap().trigger.id,
            TriggerID(2)
        );
    }

    #[tokio::test]
    async fn test_most_specific_trigger_wins() {
        let fx = test_support::fixture().await;
        let ann = fx.mem.contact(ANN).unwrap();
        let bob = fx.mem.contact(BOB).unwrap();

        let generic = trigger(1, TriggerType::Keyword, &["join"]);
        let mut doctors = trigger(2, TriggerType::Keyword, &["join"]);
        doctors.include_group_ids = vec![DOCTORS];
        let mut channel = trigger(3, TriggerType::Keyword, &["join"]);
        channel.channel_id = Some(TWILIO);
        let triggers = vec![generic, doctors, channel];

        let pick = |contact: &Contact, channel_id| {
            match_msg(&triggers, channel_id, contact, "join", false)
                .unwrap()
                .trigger
                .id
        };
        assert_eq!(pick(&ann, Some(TWILIO)), TriggerID(3));
        assert_eq!(pick(&ann, None), TriggerID(2));
        assert_eq!(pick(&bob, None), TriggerID(1));
    }

    #[tokio::test]
    async fn test_catchall_only_when_asked() {
        let fx = test_support::fixture().await;
        let ann = fx.mem.contact(ANN).unwrap();
        let mut excluded = trigger(1, TriggerType::Catchall, &[]);
        excluded.exclude_group_ids = vec![DOCTORS];
        let triggers = vec![excluded, trigger(2, TriggerType::Catchall, &[])];

        assert!(match_msg(&triggers, None, &ann, "hello", false).is_none());
        let m = match_msg(&triggers, None, &ann, "hello", true).unwrap();
        assert_eq!(m.trigger.id, TriggerID(2));
        assert_eq!(m.keyword, None);
    }

    #[tokio::test]
    async fn test_referral_prefers_matching_referrer() {
        let fx = test_support::fixture().await;
        let ann = fx.mem.contact(ANN).unwrap();
        let any = trigger(1, TriggerType::Referral, &[]);
        let mut specific = trigger(2, TriggerType::Referral, &[]);
        specific.referrer_id = Some("promo".to_string());
        let triggers = vec![any, specific];

        let pick = |referrer| {
            match_channel_event(&triggers, ChannelEventType::Referral, TWILIO, &ann, referrer)
                .map(|m| m.trigger.id)
        };
        assert_eq!(pick(Some("PROMO")), Some(TriggerID(2)));
        assert_eq!(pick(Some("other")), Some(TriggerID(1)));
        assert_eq!(pick(None), Some(TriggerID(1)));
        assert!(
            match_channel_event(&triggers, ChannelEventType::StopContact, TWILIO, &ann, None)
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_fixture_keyword_trigger() {
        let fx = test_support::fixture().await;
        let assets = fx.rt.org_assets(test_support::ORG).await.unwrap();
        let ann = fx.mem.contact(ANN).unwrap();
        let m = find_msg_trigger(&assets, Some(TWILIO), &ann, "Red", false).unwrap();
        assert_eq!(m.trigger.flow_id, test_support::FAVORITES);
        assert!(find_ticket_closed_trigger(&assets, &ann).is_none());

        let mut unknown = trigger(9, TriggerType::TicketClosed, &[]);
        unknown.include_group_ids = vec![GroupID(999)];
        assert!(match_ticket_closed(&[unknown], &ann).is_none());
    }
}
