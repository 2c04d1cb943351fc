//! Minimal lexicon: key -> text per language, falling back to English and
//! then to the key itself so a missing translation never produces an empty
//! message.

use std::collections::HashMap;

pub struct Lexicon {
    texts: HashMap<&'static str, HashMap<&'static str, &'static str>>,
}

impl Lexicon {
    pub fn builtin() -> Self {
        let mut texts: HashMap<&'static str, HashMap<&'static str, &'static str>> = HashMap::new();

        let en = texts.entry("en").or_default();
        en.insert(
            "captcha.prompt",
            "Hi {user}! Prove you are human: tap the {answer} button below within {timeout} seconds.",
        );
        en.insert("captcha.not_yours", "This challenge is not your concern.");
        en.insert("captcha.passed", "Verification passed, welcome!");
        en.insert("captcha.failed", "Verification failed.");
        en.insert("captcha.expired", "The challenge has expired.");
        en.insert("join.approved", "Your request to join {chat} was approved.");
        en.insert("join.declined", "Your request to join {chat} was declined.");
        en.insert("vote.prompt", "Is this message from {user} spam?\n\n{text}");
        en.insert("vote.yes", "Not spam");
        en.insert("vote.no", "Spam");
        en.insert("vote.link", "A message from {user} looks like spam. Vote: {link}");
        en.insert("vote.counted", "Vote counted.");
        en.insert("vote.closed", "This case is already closed.");
        en.insert("spam.banned", "{user} was removed for spam.");
        en.insert("admin.no_rights", "I lack the rights to restrict users in chat {chat}.");

        let ru = texts.entry("ru").or_default();
        ru.insert(
            "captcha.prompt",
            "Привет, {user}! Докажи, что ты человек: нажми кнопку {answer} в течение {timeout} секунд.",
        );
        ru.insert("captcha.not_yours", "Это не твоя проверка.");
        ru.insert("captcha.passed", "Проверка пройдена, добро пожаловать!");
        ru.insert("captcha.failed", "Проверка не пройдена.");
        ru.insert("captcha.expired", "Время проверки истекло.");
        ru.insert("join.approved", "Заявка на вступление в {chat} одобрена.");
        ru.insert("join.declined", "Заявка на вступление в {chat} отклонена.");
        ru.insert("vote.prompt", "Это сообщение от {user} — спам?\n\n{text}");
        ru.insert("vote.yes", "Не спам");
        ru.insert("vote.no", "Спам");
        ru.insert("vote.counted", "Голос учтён.");
        ru.insert("vote.closed", "Дело уже закрыто.");
        ru.insert("spam.banned", "{user} удалён за спам.");

        Self { texts }
    }

    /// Look up `key` for `lang`, falling back to English, then the key.
    pub fn get(&self, key: &str, lang: &str) -> String {
        self.texts
            .get(lang)
            .and_then(|m| m.get(key))
            .or_else(|| self.texts.get("en").and_then(|m| m.get(key)))
            .map(|s| s.to_string())
            .unwrap_or_else(|| key.to_string())
    }
}

/// Replace `{name}` placeholders with the supplied values.
pub fn format_template(s: &str, vars: &[(&str, &str)]) -> String {
    let mut out = s.to_string();
    for (k, v) in vars {
        out = out.replace(&format!("{{{}}}", k), v);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn falls_back_to_english_then_key() {
        let lex = Lexicon::builtin();
        assert_eq!(lex.get("vote.yes", "ru"), "Не спам");
        assert_eq!(lex.get("admin.no_rights", "ru"), lex.get("admin.no_rights", "en"));
        assert_eq!(lex.get("no.such.key", "de"), "no.such.key");
    }

    #[test]
    fn template_substitution() {
        let out = format_template("Hi {user}, tap {answer}.", &[("user", "Ann"), ("answer", "🦊")]);
        assert_eq!(out, "Hi Ann, tap 🦊.");
    }
}
