//! Detector strategies: semantic labels derived from raw provider data
//! without further provider calls. Scoring is table-driven and
//! deterministic; the same inputs always produce the same labels.

use async_trait::async_trait;

use adjutant_core::types::UserContext;
use adjutant_providers::services::EmailHandle;

use crate::context::{RequestContext, ResolvedParams, Strategy};
use crate::error::NodeError;
use crate::result::{
    ActionItem, ActionType, ClassifiedSender, NodeOutput, NodeValue, ScoredEmail, SenderType,
    UrgencyBand,
};

// ── Urgency scoring ──────────────────────────────────────────────────────
// Component weights: importance label 30, lexical cues 30, sender impact
// 25, time pressure 15. Bands: low ≥ 25, medium ≥ 50, high ≥ 75.

const URGENCY_CUES: &[(&str, u8)] = &[
    ("urgent", 15),
    ("asap", 15),
    ("immediately", 15),
    ("critical", 15),
    ("time sensitive", 15),
    ("action required", 15),
    ("deadline", 10),
    ("reminder", 5),
];

const TIME_PRESSURE_CUES: &[(&str, u8)] = &[
    ("today", 8),
    ("eod", 8),
    ("end of day", 8),
    ("tomorrow", 5),
    ("this week", 4),
    ("by friday", 6),
];

fn urgency_score(email: &EmailHandle, user: &UserContext) -> u8 {
    let text = format!("{} {}", email.subject, email.snippet).to_lowercase();

    let importance = if email.important || email.labels.iter().any(|l| l == "important") {
        30u8
    } else {
        0
    };

    let lexical: u8 = URGENCY_CUES
        .iter()
        .filter(|(cue, _)| text.contains(cue))
        .map(|(_, w)| *w)
        .sum::<u8>()
        .min(30);

    let sender = if user.vip.iter().any(|v| v.eq_ignore_ascii_case(&email.from.email)) {
        25u8
    } else if !user.org_domain.is_empty() && email.from.domain() == user.org_domain {
        15
    } else {
        0
    };

    let time_pressure: u8 = TIME_PRESSURE_CUES
        .iter()
        .filter(|(cue, _)| text.contains(cue))
        .map(|(_, w)| *w)
        .sum::<u8>()
        .min(15);

    importance + lexical + sender + time_pressure
}

/// Scores emails 0-100 and filters by the requested band.
pub struct UrgencyDetector;

#[async_trait]
impl Strategy for UrgencyDetector {
    fn id(&self) -> &'static str {
        "urgency_detector"
    }

    async fn execute(
        &self,
        ctx: &RequestContext,
        params: &ResolvedParams,
    ) -> Result<NodeOutput, NodeError> {
        ctx.check_cancelled()?;
        let handles = params
            .input("input_email_ids")?
            .email_handles()
            .ok_or_else(|| NodeError::BadInput("input is not an email list".to_string()))?;
        let threshold = params
            .str_param("threshold")
            .and_then(UrgencyBand::parse);

        let mut scored: Vec<ScoredEmail> = handles
            .into_iter()
            .map(|handle| {
                let score = urgency_score(&handle, &ctx.user);
                ScoredEmail {
                    handle,
                    score,
                    band: UrgencyBand::from_score(score),
                }
            })
            .filter(|s| match threshold {
                Some(min) => s.band.map(|b| b >= min).unwrap_or(false),
                None => true,
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .cmp(&a.score)
                .then(b.handle.ts.cmp(&a.handle.ts))
                .then(a.handle.id.cmp(&b.handle.id))
        });
        Ok(NodeOutput::new(NodeValue::Scored(scored)))
    }
}

// ── Sender classification ────────────────────────────────────────────────

const INVESTOR_DOMAIN_PATTERNS: &[&str] = &["capital", "ventures", "vc", "partners", "fund"];
const VENDOR_SENDER_PATTERNS: &[&str] =
    &["billing", "invoice", "noreply", "no-reply", "notifications", "sales", "support"];

fn classify_sender(email: &EmailHandle, user: &UserContext, from_count: usize) -> ClassifiedSender {
    let addr = email.from.email.to_lowercase();
    let domain = email.from.domain().to_lowercase();
    let localpart = addr.split('@').next().unwrap_or("").to_string();
    let is_vip = user.vip.iter().any(|v| v.eq_ignore_ascii_case(&addr));
    let in_org = !user.org_domain.is_empty() && domain == user.org_domain.to_lowercase();

    let sender_type = if in_org {
        if is_vip {
            SenderType::Boss
        } else {
            SenderType::Peer
        }
    } else if INVESTOR_DOMAIN_PATTERNS.iter().any(|p| domain.contains(p)) {
        SenderType::Investor
    } else if VENDOR_SENDER_PATTERNS
        .iter()
        .any(|p| localpart.contains(p) || domain.starts_with(p))
    {
        SenderType::Vendor
    } else if from_count >= 3 {
        // Frequent external correspondent with no structural signal.
        SenderType::Customer
    } else {
        SenderType::Unknown
    };

    ClassifiedSender {
        handle: email.clone(),
        sender_type,
        vip_score: if is_vip {
            100
        } else if in_org {
            60
        } else {
            (from_count as u8).saturating_mul(10).min(50)
        },
    }
}

/// Classifies senders and optionally keeps only one type.
pub struct SenderClassifier;

#[async_trait]
impl Strategy for SenderClassifier {
    fn id(&self) -> &'static str {
        "sender_classifier"
    }

    async fn execute(
        &self,
        ctx: &RequestContext,
        params: &ResolvedParams,
    ) -> Result<NodeOutput, NodeError> {
        ctx.check_cancelled()?;
        let handles = params
            .input("input_email_ids")?
            .email_handles()
            .ok_or_else(|| NodeError::BadInput("input is not an email list".to_string()))?;
        let filter_type = params.str_param("filter_type").map(str::to_string);

        let mut counts: std::collections::BTreeMap<String, usize> = Default::default();
        for handle in &handles {
            *counts.entry(handle.from.email.to_lowercase()).or_default() += 1;
        }

        let classified: Vec<ClassifiedSender> = handles
            .iter()
            .map(|handle| {
                let count = counts
                    .get(&handle.from.email.to_lowercase())
                    .copied()
                    .unwrap_or(0);
                classify_sender(handle, &ctx.user, count)
            })
            .filter(|c| match &filter_type {
                Some(t) => c.sender_type.as_str() == t,
                None => true,
            })
            .collect();

        Ok(NodeOutput::new(NodeValue::Senders(classified)))
    }
}

// ── Action detection ─────────────────────────────────────────────────────

const REPLY_CUES: &[&str] = &[
    "can you",
    "could you",
    "let me know",
    "what do you think",
    "thoughts?",
    "please respond",
    "get back to me",
];
const REVIEW_CUES: &[&str] = &["review", "take a look", "feedback on", "look over"];
const DECIDE_CUES: &[&str] = &["approve", "sign off", "decision", "confirm by", "choose"];

fn detect_action(email: &EmailHandle) -> (ActionType, u8) {
    let text = format!("{} {}", email.subject, email.snippet).to_lowercase();

    let mut reply: u8 = 0;
    let mut review: u8 = 0;
    let mut decide: u8 = 0;

    if text.contains('?') {
        reply += 30;
    }
    reply += (REPLY_CUES.iter().filter(|c| text.contains(*c)).count() as u8) * 25;
    review += (REVIEW_CUES.iter().filter(|c| text.contains(*c)).count() as u8) * 30;
    decide += (DECIDE_CUES.iter().filter(|c| text.contains(*c)).count() as u8) * 30;

    // Direct, single-recipient mail is more likely to need the user's hand.
    if email.to.len() == 1 {
        reply = reply.saturating_add(20);
    }
    if email.unread {
        reply = reply.saturating_add(10);
    }

    // First strict maximum wins, so on ties decide > review > reply.
    let (action, score) = [
        (ActionType::Decide, decide),
        (ActionType::Review, review),
        (ActionType::Reply, reply),
    ]
    .into_iter()
    .fold((ActionType::None, 0u8), |best, cur| {
        if cur.1 > best.1 {
            cur
        } else {
            best
        }
    });

    if score < 25 {
        (ActionType::None, score.min(100))
    } else {
        (action, score.min(100))
    }
}

/// Labels messages reply / review / decide / none with confidence.
pub struct ActionDetector;

#[async_trait]
impl Strategy for ActionDetector {
    fn id(&self) -> &'static str {
        "action_detector"
    }

    async fn execute(
        &self,
        ctx: &RequestContext,
        params: &ResolvedParams,
    ) -> Result<NodeOutput, NodeError> {
        ctx.check_cancelled()?;
        let handles = params
            .input("input_email_ids")?
            .email_handles()
            .ok_or_else(|| NodeError::BadInput("input is not an email list".to_string()))?;
        let min_confidence = params.u64_param("min_confidence").unwrap_or(25) as u8;

        let mut items: Vec<ActionItem> = handles
            .into_iter()
            .map(|handle| {
                let (action, confidence) = detect_action(&handle);
                ActionItem {
                    handle,
                    action,
                    confidence,
                }
            })
            .filter(|item| item.action != ActionType::None && item.confidence >= min_confidence)
            .collect();

        items.sort_by(|a, b| {
            b.confidence
                .cmp(&a.confidence)
                .then(b.handle.ts.cmp(&a.handle.ts))
                .then(a.handle.id.cmp(&b.handle.id))
        });
        Ok(NodeOutput::new(NodeValue::Actions(items)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adjutant_providers::services::Address;
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;

    fn user() -> UserContext {
        UserContext {
            user_id: "u1".to_string(),
            enrolled: BTreeMap::new(),
            timezone: "UTC".to_string(),
            locale: "en-US".to_string(),
            preferences: Default::default(),
            vip: vec!["ceo@acme.com".to_string()],
            org_domain: "acme.com".to_string(),
        }
    }

    fn email(id: &str, from: &str, subject: &str, snippet: &str) -> EmailHandle {
        EmailHandle {
            id: id.to_string(),
            thread_id: format!("t-{id}"),
            from: Address {
                name: None,
                email: from.to_string(),
            },
            to: vec![Address {
                name: None,
                email: "me@acme.com".to_string(),
            }],
            subject: subject.to_string(),
            snippet: snippet.to_string(),
            labels: vec![],
            unread: true,
            important: false,
            has_attachment: false,
            ts: Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap(),
        }
    }

    #[test]
    fn vip_urgent_mail_scores_high() {
        let mut handle = email("m1", "ceo@acme.com", "URGENT: board deck", "need this asap today");
        handle.important = true;
        let score = urgency_score(&handle, &user());
        assert!(score >= 75, "expected high urgency, got {score}");
    }

    #[test]
    fn newsletter_scores_below_low_band() {
        let handle = email("m2", "digest@news.example", "Weekly digest", "top stories for you");
        let score = urgency_score(&handle, &user());
        assert!(score < 25, "expected no band, got {score}");
        assert_eq!(UrgencyBand::from_score(score), None);
    }

    #[test]
    fn investor_domains_classify_as_investor() {
        let handle = email("m3", "alex@sequoiacapital.com", "Q3 check-in", "");
        let classified = classify_sender(&handle, &user(), 1);
        assert_eq!(classified.sender_type, SenderType::Investor);
    }

    #[test]
    fn org_domain_classifies_as_peer_and_vip_as_boss() {
        let peer = classify_sender(&email("m4", "jo@acme.com", "standup", ""), &user(), 1);
        assert_eq!(peer.sender_type, SenderType::Peer);
        let boss = classify_sender(&email("m5", "ceo@acme.com", "1:1", ""), &user(), 1);
        assert_eq!(boss.sender_type, SenderType::Boss);
        assert_eq!(boss.vip_score, 100);
    }

    #[test]
    fn vendor_patterns_classify_as_vendor() {
        let handle = email("m6", "noreply@billing.stripe.com", "Invoice", "");
        let classified = classify_sender(&handle, &user(), 1);
        assert_eq!(classified.sender_type, SenderType::Vendor);
    }

    #[test]
    fn frequent_external_sender_classifies_as_customer() {
        let handle = email("m7", "pat@client.example", "order update", "");
        let classified = classify_sender(&handle, &user(), 4);
        assert_eq!(classified.sender_type, SenderType::Customer);
    }

    #[test]
    fn question_mail_needs_reply() {
        let handle = email(
            "m8",
            "jo@acme.com",
            "Offsite date",
            "Can you make the 14th? Let me know",
        );
        let (action, confidence) = detect_action(&handle);
        assert_eq!(action, ActionType::Reply);
        assert!(confidence >= 50);
    }

    #[test]
    fn approval_mail_needs_decision() {
        let handle = email("m9", "jo@acme.com", "Budget sign off", "please approve the Q3 budget");
        let (action, _) = detect_action(&handle);
        assert_eq!(action, ActionType::Decide);
    }

    #[test]
    fn bare_notification_needs_nothing() {
        let mut handle = email("m10", "noreply@github.com", "Build passed", "main is green");
        handle.to = vec![];
        handle.unread = false;
        let (action, _) = detect_action(&handle);
        assert_eq!(action, ActionType::None);
    }
}
