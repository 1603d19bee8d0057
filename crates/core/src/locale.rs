//! Interface locales and locale resolution for newly registered users.

use core::str::FromStr;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::DomainError;
use crate::key::KeyPart;

macro_rules! locales {
    ($($variant:ident => $code:literal),* $(,)?) => {
        /// Interface locale of the bot.
        #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum Locale {
            $(#[serde(rename = $code)] $variant,)*
        }

        impl Locale {
            pub const ALL: &'static [Locale] = &[$(Locale::$variant),*];

            pub const fn as_str(&self) -> &'static str {
                match self {
                    $(Locale::$variant => $code,)*
                }
            }
        }

        impl FromStr for Locale {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($code => Ok(Locale::$variant),)*
                    other => Err(DomainError::unknown_locale(other)),
                }
            }
        }
    };
}

locales! {
    En => "en",
    Uk => "uk",
    Ar => "ar",
    Az => "az",
    Be => "be",
    Cs => "cs",
    De => "de",
    Es => "es",
    Fa => "fa",
    Fr => "fr",
    He => "he",
    Hi => "hi",
    Id => "id",
    It => "it",
    Ja => "ja",
    Kk => "kk",
    Ko => "ko",
    Ms => "ms",
    Nl => "nl",
    Pl => "pl",
    Pt => "pt",
    Ro => "ro",
    Sr => "sr",
    Tr => "tr",
    Uz => "uz",
    Vi => "vi",
    Ru => "ru",
}

impl Default for Locale {
    fn default() -> Self {
        Locale::En
    }
}

impl core::fmt::Display for Locale {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl KeyPart for Locale {
    fn encode_key(&self) -> String {
        self.as_str().to_string()
    }
}

/// Decides which interface locale a new user starts with.
pub trait LocaleResolver {
    /// Supported locale matching the platform code, if any.
    fn supported(&self, code: &str) -> Option<Locale>;

    fn default_locale(&self) -> Locale;

    /// Platform locale when supported, otherwise the default.
    fn resolve(&self, code: Option<&str>) -> Locale {
        code.and_then(|code| self.supported(code))
            .unwrap_or_else(|| self.default_locale())
    }
}

/// Configured set of supported locales plus the fallback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocaleSet {
    #[serde(deserialize_with = "deserialize_locale_list")]
    pub supported: Vec<Locale>,
    pub default: Locale,
}

impl LocaleSet {
    pub fn new(supported: impl Into<Vec<Locale>>, default: Locale) -> Self {
        Self {
            supported: supported.into(),
            default,
        }
    }
}

impl Default for LocaleSet {
    fn default() -> Self {
        Self::new(Locale::ALL, Locale::En)
    }
}

impl LocaleResolver for LocaleSet {
    fn supported(&self, code: &str) -> Option<Locale> {
        let locale = Locale::from_str(code).ok()?;
        self.supported.contains(&locale).then_some(locale)
    }

    fn default_locale(&self) -> Locale {
        self.default
    }
}

/// Accepts either a sequence or a comma-separated string (`"en,uk"`).
fn deserialize_locale_list<'de, D>(deserializer: D) -> Result<Vec<Locale>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        List(Vec<Locale>),
        Joined(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::List(list) => Ok(list),
        Raw::Joined(joined) => joined
            .split(',')
            .map(str::trim)
            .filter(|code| !code.is_empty())
            .map(|code| Locale::from_str(code).map_err(serde::de::Error::custom))
            .collect(),
    }
}
