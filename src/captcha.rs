//! Captcha generator: picks a handful of emoji options, marks one correct,
//! and encodes per-button callback payloads so nothing about the correct
//! answer leaks from token structure.
//!
//! Button payloads are `"<user_id>;<token>"`. The correct button carries the
//! challenge's stored success token; every decoy carries a freshly generated
//! random token, so tokens are single-use and cross-session reuse tells an
//! attacker nothing.

use rand::distributions::Alphanumeric;
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::HashSet;

pub const ALLOWED_OPTION_COUNTS: &[usize] = &[3, 4, 5, 6, 8, 10];
pub const DEFAULT_OPTION_COUNT: usize = 6;

const TOKEN_LEN: usize = 16;

/// (button label, spoken name used in the prompt)
type Pair = (&'static str, &'static str);

const EN_VOCAB: &[Pair] = &[
    ("🐶", "dog"),
    ("🐱", "cat"),
    ("🦊", "fox"),
    ("🐼", "panda"),
    ("🦁", "lion"),
    ("🐸", "frog"),
    ("🐙", "octopus"),
    ("🦉", "owl"),
    ("🐳", "whale"),
    ("🐝", "bee"),
    ("🦀", "crab"),
    ("🐢", "turtle"),
];

const RU_VOCAB: &[Pair] = &[
    ("🐶", "собака"),
    ("🐱", "кот"),
    ("🦊", "лиса"),
    ("🐼", "панда"),
    ("🦁", "лев"),
    ("🐸", "лягушка"),
    ("🐙", "осьминог"),
    ("🦉", "сова"),
    ("🐳", "кит"),
    ("🐝", "пчела"),
    ("🦀", "краб"),
    ("🐢", "черепаха"),
];

// Last-resort set when even English is unavailable.
const MINIMAL_VOCAB: &[Pair] = &[("🐶", "dog"), ("🐱", "cat"), ("🦊", "fox")];

#[derive(Debug, Clone)]
pub struct CaptchaButton {
    pub label: String,
    pub payload: String,
}

#[derive(Debug, Clone)]
pub struct Captcha {
    /// Button rows, laid out for narrow screens.
    pub rows: Vec<Vec<CaptchaButton>>,
    /// Spoken name of the correct option, for the prompt text.
    pub answer_name: String,
}

fn vocab_for(lang: &str) -> &'static [Pair] {
    let v = match lang {
        "ru" => RU_VOCAB,
        "en" => EN_VOCAB,
        _ => EN_VOCAB,
    };
    if v.is_empty() { MINIMAL_VOCAB } else { v }
}

fn normalize_count(requested: usize) -> usize {
    if ALLOWED_OPTION_COUNTS.contains(&requested) {
        requested
    } else {
        DEFAULT_OPTION_COUNT
    }
}

pub fn random_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LEN)
        .map(char::from)
        .collect()
}

/// Split `buttons` into keyboard rows: one row for five or fewer options,
/// two balanced rows otherwise.
fn layout(mut buttons: Vec<CaptchaButton>) -> Vec<Vec<CaptchaButton>> {
    if buttons.len() <= 5 {
        return vec![buttons];
    }
    let bottom = buttons.split_off(buttons.len() / 2);
    vec![buttons, bottom]
}

pub fn build_captcha(
    lang: &str,
    user_id: i64,
    success_token: &str,
    option_count: usize,
) -> Captcha {
    let vocab = vocab_for(lang);
    let count = normalize_count(option_count).min(vocab.len());

    let mut rng = rand::thread_rng();
    let mut pairs: Vec<Pair> = vocab.to_vec();
    pairs.shuffle(&mut rng);
    pairs.truncate(count);

    let correct = rng.gen_range(0..count);
    let answer_name = pairs[correct].1.to_string();

    let mut used: HashSet<String> = HashSet::new();
    used.insert(success_token.to_string());

    let buttons = pairs
        .into_iter()
        .enumerate()
        .map(|(i, (label, _))| {
            let token = if i == correct {
                success_token.to_string()
            } else {
                loop {
                    let t = random_token();
                    if used.insert(t.clone()) {
                        break t;
                    }
                }
            };
            CaptchaButton {
                label: label.to_string(),
                payload: format!("{};{}", user_id, token),
            }
        })
        .collect();

    Captcha {
        rows: layout(buttons),
        answer_name,
    }
}

/// Parse a `"<user_id>;<token>"` callback payload.
pub fn parse_payload(data: &str) -> Option<(i64, &str)> {
    let (uid, token) = data.split_once(';')?;
    let uid = uid.parse::<i64>().ok()?;
    if token.is_empty() {
        return None;
    }
    Some((uid, token))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_buttons(c: &Captcha) -> Vec<&CaptchaButton> {
        c.rows.iter().flatten().collect()
    }

    #[test]
    fn tokens_are_unique_with_one_correct() {
        for &n in ALLOWED_OPTION_COUNTS {
            let c = build_captcha("en", 42, "SUCCESS", n);
            let buttons = all_buttons(&c);
            assert_eq!(buttons.len(), n);

            let tokens: HashSet<&str> = buttons
                .iter()
                .map(|b| b.payload.split_once(';').unwrap().1)
                .collect();
            assert_eq!(tokens.len(), n, "decoy tokens must be pairwise distinct");

            let correct = buttons
                .iter()
                .filter(|b| b.payload == "42;SUCCESS")
                .count();
            assert_eq!(correct, 1);
        }
    }

    #[test]
    fn invalid_count_falls_back_to_default() {
        let c = build_captcha("en", 1, "t", 7);
        assert_eq!(all_buttons(&c).len(), DEFAULT_OPTION_COUNT);
        let c = build_captcha("en", 1, "t", 0);
        assert_eq!(all_buttons(&c).len(), DEFAULT_OPTION_COUNT);
    }

    #[test]
    fn unknown_language_falls_back_to_english() {
        let c = build_captcha("xx", 1, "t", 3);
        assert!(EN_VOCAB.iter().any(|(_, name)| *name == c.answer_name));
    }

    #[test]
    fn row_layout_is_balanced() {
        let c = build_captcha("en", 1, "t", 5);
        assert_eq!(c.rows.len(), 1);

        for &n in &[6usize, 8, 10] {
            let c = build_captcha("en", 1, "t", n);
            assert_eq!(c.rows.len(), 2);
            assert_eq!(c.rows[0].len(), n / 2);
            assert_eq!(c.rows[1].len(), n - n / 2);
        }
    }

    #[test]
    fn payload_roundtrip_and_rejects() {
        assert_eq!(parse_payload("42;abc"), Some((42, "abc")));
        assert_eq!(parse_payload("notanumber;abc"), None);
        assert_eq!(parse_payload("42;"), None);
        assert_eq!(parse_payload("garbage"), None);
    }
}
