//! Heuristic extraction of verification codes from page text and
//! navigation payloads. Pure functions, no I/O.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::types::OtpValue;

/// Codes shorter than 4 or longer than 10 digits are ignored on purpose:
/// anything outside that range is usually a date, a phone fragment, or an
/// account number rather than a one-time code.
pub const MIN_OTP_DIGITS: usize = 4;
pub const MAX_OTP_DIGITS: usize = 10;

/// Phrases that mark surrounding text as 2FA-related.
const CONTEXT_TERMS: &[&str] = &[
    "one-time password",
    "one time password",
    "one-time passcode",
    "one time passcode",
    "one-time code",
    "one time code",
    "verification code",
    "verification pin",
    "authentication code",
    "authorization code",
    "security code",
    "access code",
    "login code",
    "sign-in code",
    "signin code",
    "confirmation code",
    "sms code",
    "email code",
    "auth code",
    "2fa code",
    "mfa code",
    "2fa",
    "mfa",
    "otp",
    "totp",
    "passcode",
];

/// Verbs that introduce a code when the text is already known to be
/// 2FA-related ("enter 582910").
const ACTION_VERBS: &[&str] = &[
    "enter", "input", "type", "use", "insert", "provide", "submit", "paste",
];

/// Normalized object keys that carry codes in structured payloads.
const KEY_ALIASES: &[&str] = &[
    "otp",
    "totp",
    "otpcode",
    "totpcode",
    "otpvalue",
    "onetimepassword",
    "onetimepasscode",
    "onetimecode",
    "verificationcode",
    "verifycode",
    "verificationpin",
    "authcode",
    "authenticationcode",
    "authorizationcode",
    "securitycode",
    "accesscode",
    "logincode",
    "signincode",
    "confirmationcode",
    "smscode",
    "emailcode",
    "2facode",
    "mfacode",
    "twofactorcode",
    "passcode",
];

/// Payload nesting deeper than this is not walked. `serde_json::Value`
/// cannot be cyclic, so a depth bound is all the loop protection needed.
const MAX_PAYLOAD_DEPTH: usize = 64;

fn term_alternation(terms: &[&str]) -> String {
    // Longest first, so "2fa code" wins over "2fa" in the alternation.
    let mut sorted: Vec<&str> = terms.to_vec();
    sorted.sort_by_key(|t| std::cmp::Reverse(t.len()));
    sorted
        .iter()
        .map(|t| regex::escape(t))
        .collect::<Vec<_>>()
        .join("|")
}

fn code_after_context_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(&format!(
            r"(?is)\b(?:{})\b.{{0,40}}?\b(\d{{{},{}}})\b",
            term_alternation(CONTEXT_TERMS),
            MIN_OTP_DIGITS,
            MAX_OTP_DIGITS
        ))
        .expect("context-then-code pattern compiles")
    })
}

fn code_before_context_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(&format!(
            r"(?is)\b(\d{{{},{}}})\b.{{0,20}}?\b(?:{})\b",
            MIN_OTP_DIGITS,
            MAX_OTP_DIGITS,
            term_alternation(CONTEXT_TERMS)
        ))
        .expect("code-then-context pattern compiles")
    })
}

fn verb_code_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(&format!(
            r"(?is)\b(?:{})\b.{{0,20}}?\b(\d{{{},{}}})\b",
            term_alternation(ACTION_VERBS),
            MIN_OTP_DIGITS,
            MAX_OTP_DIGITS
        ))
        .expect("verb-then-code pattern compiles")
    })
}

fn context_marker_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(&format!(r"(?i)\b(?:{})\b", term_alternation(CONTEXT_TERMS)))
            .expect("context marker pattern compiles")
    })
}

/// Scan free text for a plausible verification code.
///
/// Tries, in order: a context term followed by a 4-10 digit run within
/// 40 chars, a digit run followed by a context term within 20 chars,
/// and, only when the text carries a bare context marker (or
/// `assume_otp_context` is set), an action verb followed by a digit run.
pub fn extract_totp_from_text(text: &str, assume_otp_context: bool) -> Option<OtpValue> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    if let Some(caps) = code_after_context_re().captures(text) {
        return Some(OtpValue::totp(&caps[1]));
    }
    if let Some(caps) = code_before_context_re().captures(text) {
        return Some(OtpValue::totp(&caps[1]));
    }
    if assume_otp_context || context_marker_re().is_match(text) {
        if let Some(caps) = verb_code_re().captures(text) {
            return Some(OtpValue::totp(&caps[1]));
        }
    }
    None
}

/// Walk a structured navigation payload looking for a code under a
/// known key alias. A bare string payload is scanned as text with
/// forced context.
pub fn extract_totp_from_navigation_payload(payload: &Value) -> Option<OtpValue> {
    match payload {
        Value::String(text) => extract_totp_from_text(text, true),
        other => walk_payload(other, 0),
    }
}

/// Payload first, natural-language goal second.
pub fn extract_totp_from_navigation_inputs(
    navigation_payload: Option<&Value>,
    navigation_goal: Option<&str>,
) -> Option<OtpValue> {
    if let Some(payload) = navigation_payload {
        if let Some(found) = extract_totp_from_navigation_payload(payload) {
            return Some(found);
        }
    }
    navigation_goal.and_then(|goal| extract_totp_from_text(goal, false))
}

fn walk_payload(value: &Value, depth: usize) -> Option<OtpValue> {
    if depth >= MAX_PAYLOAD_DEPTH {
        return None;
    }
    match value {
        Value::Object(map) => {
            // Alias keys at this level take priority over nested matches.
            for (key, val) in map {
                if KEY_ALIASES.contains(&normalize_key(key).as_str()) {
                    if let Some(found) = candidate_from_value(val) {
                        return Some(found);
                    }
                }
            }
            map.values().find_map(|val| walk_payload(val, depth + 1))
        }
        Value::Array(items) => items.iter().find_map(|item| walk_payload(item, depth + 1)),
        _ => None,
    }
}

fn candidate_from_value(value: &Value) -> Option<OtpValue> {
    match value {
        Value::String(text) => {
            let text = text.trim();
            if is_bare_code(text) {
                Some(OtpValue::totp(text))
            } else {
                extract_totp_from_text(text, true)
            }
        }
        Value::Number(n) => {
            let digits = n.to_string();
            is_bare_code(&digits).then(|| OtpValue::totp(digits))
        }
        _ => None,
    }
}

fn is_bare_code(text: &str) -> bool {
    (MIN_OTP_DIGITS..=MAX_OTP_DIGITS).contains(&text.len())
        && text.bytes().all(|b| b.is_ascii_digit())
}

/// Lowercased, alphanumeric-only key form, so "mfa-code", "MFA Code" and
/// "mfaCode" all normalize to "mfacode".
pub(crate) fn normalize_key(key: &str) -> String {
    key.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}
