//! Internationalization (i18n) support for `stroop-runner`.
//!
//! This module wires together:
//! - `i18n-embed` (language selection + asset loading)
//! - `fluent` (message formatting)
//! - `rust-embed` (compile-time embedding of `.ftl` files)
//! - `i18n-embed-fl` (`fl!` macro for compile-time checked lookups)
//!
//! Folder layout (relative to this crate root):
//! ```text
//! i18n.toml
//! i18n/
//!   en-US/stroop-runner.ftl   (fallback/reference)
//!   ja-JP/stroop-runner.ftl
//! ```
//!
//! Unlike a UI crate with one global language, a single process may run
//! sessions for participants in different languages, so there is one loader
//! per supported [`Language`], each selected once on first use.
//!
//! The static built-in feedback patterns live here too, as
//! `pattern-<scenario>-<n>` messages.

use i18n_embed::fluent::FluentLanguageLoader;
use once_cell::sync::Lazy;
use rust_embed::Embed;
use serde::{Deserialize, Serialize};
use unic_langid::LanguageIdentifier;

pub use i18n_embed_fl::fl; // Re-export for convenience.

/// Fluent "domain" (matches the crate / the fallback FTL filename).
const DOMAIN: &str = "stroop-runner";

const FALLBACK: &str = "en-US";

/// Embed all locale folders under `i18n/`.
#[derive(Embed)]
#[folder = "i18n"]
struct Localizations;

/// Languages a session can run in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    Ja,
    En,
}

impl Language {
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Ja => "ja-JP",
            Self::En => "en-US",
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Ja => "ja",
            Self::En => "en",
        }
    }

    fn identifier(&self) -> LanguageIdentifier {
        self.tag().parse().expect("valid language identifier")
    }
}

static LOADER_JA: Lazy<FluentLanguageLoader> = Lazy::new(|| build_loader(Language::Ja));
static LOADER_EN: Lazy<FluentLanguageLoader> = Lazy::new(|| build_loader(Language::En));

fn build_loader(language: Language) -> FluentLanguageLoader {
    let fallback: LanguageIdentifier = FALLBACK.parse().expect("valid fallback language identifier");
    let loader = FluentLanguageLoader::new(DOMAIN, fallback);
    if let Err(err) = i18n_embed::select(&loader, &Localizations, &[language.identifier()]) {
        tracing::warn!(
            language = language.tag(),
            "failed selecting language ({err}); continuing with fallback"
        );
    }
    // Messages are plain text for the participant screen, not bidi markup.
    loader.set_use_isolating(false);
    loader
}

/// Loader bound to `language` (selected lazily, once).
pub fn loader(language: Language) -> &'static FluentLanguageLoader {
    match language {
        Language::Ja => &*LOADER_JA,
        Language::En => &*LOADER_EN,
    }
}

/// Look up a message whose id is only known at runtime.
pub fn message(language: Language, id: &str) -> String {
    loader(language).get(id)
}

pub fn has_message(language: Language, id: &str) -> bool {
    loader(language).has(id)
}

/// List available (embedded) language identifiers.
pub fn available_languages() -> Vec<String> {
    let mut langs = Localizations::iter()
        .filter_map(|path| path.split('/').next().map(|s| s.to_string()))
        .collect::<Vec<_>>();
    langs.sort();
    langs.dedup();
    langs
}
