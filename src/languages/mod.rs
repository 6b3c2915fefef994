//! Target languages and the scripts they are written in.

use anyhow::{Result, anyhow};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
    Han,
    Kana,
    Hangul,
    Latin,
    Cyrillic,
    Arabic,
    Thai,
    Devanagari,
}

impl Script {
    pub fn contains(&self, ch: char) -> bool {
        let code = ch as u32;
        match self {
            Script::Han => matches!(code, 0x4E00..=0x9FFF | 0x3400..=0x4DBF | 0xF900..=0xFAFF),
            Script::Kana => matches!(code, 0x3040..=0x30FF | 0x31F0..=0x31FF),
            Script::Hangul => matches!(code, 0xAC00..=0xD7AF | 0x1100..=0x11FF | 0x3130..=0x318F),
            // weak: untranslated English source text passes this too
            Script::Latin => ch.is_alphabetic() && matches!(code, 0x0041..=0x024F),
            Script::Cyrillic => matches!(code, 0x0400..=0x04FF),
            Script::Arabic => matches!(code, 0x0600..=0x06FF | 0x0750..=0x077F),
            Script::Thai => matches!(code, 0x0E00..=0x0E7F),
            Script::Devanagari => matches!(code, 0x0900..=0x097F),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Language {
    pub code: &'static str,
    pub name: &'static str,
    /// Any character from one of these scripts counts as target-language text.
    pub scripts: &'static [Script],
}

impl Language {
    pub fn is_latin(&self) -> bool {
        self.scripts == [Script::Latin]
    }

    /// Whether `text` contains at least one character written in this
    /// language's scripts.
    pub fn has_script_text(&self, text: &str) -> bool {
        text.chars()
            .any(|ch| self.scripts.iter().any(|script| script.contains(ch)))
    }
}

pub const DEFAULT_LANGUAGE: &str = "zh-hant";

const LANGUAGES: &[Language] = &[
    Language {
        code: "zh-hant",
        name: "Traditional Chinese (Taiwan)",
        scripts: &[Script::Han],
    },
    Language {
        code: "zh-hans",
        name: "Simplified Chinese",
        scripts: &[Script::Han],
    },
    Language {
        code: "ja",
        name: "Japanese",
        scripts: &[Script::Han, Script::Kana],
    },
    Language {
        code: "ko",
        name: "Korean",
        scripts: &[Script::Hangul, Script::Han],
    },
    Language {
        code: "en",
        name: "English",
        scripts: &[Script::Latin],
    },
    Language {
        code: "fr",
        name: "French",
        scripts: &[Script::Latin],
    },
    Language {
        code: "de",
        name: "German",
        scripts: &[Script::Latin],
    },
    Language {
        code: "es",
        name: "Spanish",
        scripts: &[Script::Latin],
    },
    Language {
        code: "it",
        name: "Italian",
        scripts: &[Script::Latin],
    },
    Language {
        code: "pt",
        name: "Portuguese",
        scripts: &[Script::Latin],
    },
    Language {
        code: "ru",
        name: "Russian",
        scripts: &[Script::Cyrillic],
    },
    Language {
        code: "ar",
        name: "Arabic",
        scripts: &[Script::Arabic],
    },
    Language {
        code: "th",
        name: "Thai",
        scripts: &[Script::Thai],
    },
    Language {
        code: "hi",
        name: "Hindi",
        scripts: &[Script::Devanagari],
    },
];

const ALIASES: &[(&str, &str)] = &[
    ("zh-tw", "zh-hant"),
    ("zh_tw", "zh-hant"),
    ("zho-hant", "zh-hant"),
    ("zh-cn", "zh-hans"),
    ("zh_cn", "zh-hans"),
    ("zho-hans", "zh-hans"),
    ("zh", "zh-hans"),
    ("jpn", "ja"),
    ("kor", "ko"),
    ("eng", "en"),
];

#[derive(Debug, Clone, Copy, Default)]
pub struct LanguageRegistry;

impl LanguageRegistry {
    pub fn load() -> Self {
        LanguageRegistry
    }

    pub fn languages(&self) -> &'static [Language] {
        LANGUAGES
    }

    pub fn find(&self, code: &str) -> Option<&'static Language> {
        let code = normalize_code(code);
        let code = ALIASES
            .iter()
            .find(|(alias, _)| *alias == code)
            .map(|(_, target)| target.to_string())
            .unwrap_or(code);
        LANGUAGES.iter().find(|language| language.code == code)
    }

    pub fn resolve(&self, code: &str) -> Result<&'static Language> {
        self.find(code).ok_or_else(|| {
            let known = LANGUAGES
                .iter()
                .map(|language| language.code)
                .collect::<Vec<_>>()
                .join(", ");
            anyhow!("unsupported target language '{}' (known: {})", code, known)
        })
    }

    pub fn is_valid_code(&self, code: &str) -> bool {
        self.find(code).is_some()
    }
}

fn normalize_code(code: &str) -> String {
    code.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aliases_resolve_to_canonical_codes() {
        let registry = LanguageRegistry::load();
        assert_eq!(registry.find("zh-TW").unwrap().code, "zh-hant");
        assert_eq!(registry.find(" ZHO-HANS ").unwrap().code, "zh-hans");
        assert!(registry.is_valid_code("ja"));
        assert!(!registry.is_valid_code("klingon"));
        assert!(registry.resolve("klingon").is_err());
    }

    #[test]
    fn han_text_counts_for_chinese() {
        let registry = LanguageRegistry::load();
        let zh = registry.find(DEFAULT_LANGUAGE).unwrap();
        assert!(zh.has_script_text("結果 shown in Figure 1"));
        assert!(!zh.has_script_text("Results shown in Figure 1"));
    }

    #[test]
    fn kana_counts_for_japanese_but_not_chinese() {
        let registry = LanguageRegistry::load();
        assert!(registry.find("ja").unwrap().has_script_text("これは"));
        assert!(!registry.find("zh-hant").unwrap().has_script_text("これは"));
    }

    #[test]
    fn latin_languages_are_flagged() {
        let registry = LanguageRegistry::load();
        assert!(registry.find("fr").unwrap().is_latin());
        assert!(!registry.find("ko").unwrap().is_latin());
    }
}
