use std::sync::LazyLock;

use regex::Regex;

/// Marker every upstream prompt starts with.
pub const PREAMBLE_MARKER: &str = "<|begin_of_text|>";

const MONOLOGUE: &str = include_str!("prompt/monologue.txt");
const MARKET: &str = include_str!("prompt/market.txt");

static SCRIPT_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<script\b[^<]*(?:<[^<]*)*?</script>").expect("script tag pattern is valid")
});

/// Built-in persona preambles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Persona {
    /// The long-form Gov. Finn monologue.
    Monologue,
    /// A short market-commentary instruction.
    Market,
}

impl Persona {
    pub fn text(self) -> &'static str {
        match self {
            Persona::Monologue => MONOLOGUE,
            Persona::Market => MARKET,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PromptBuilder {
    persona: String,
}

impl PromptBuilder {
    pub fn new(persona: impl Into<String>) -> Self {
        let persona = persona.into();
        Self {
            persona: persona.trim_end().to_string(),
        }
    }

    pub fn from_persona(persona: Persona) -> Self {
        Self::new(persona.text())
    }

    pub fn persona(&self) -> &str {
        &self.persona
    }

    pub fn build(&self, user_text: &str, use_persona: bool) -> String {
        if use_persona {
            format!("{PREAMBLE_MARKER}\n{}\n\n{user_text}", self.persona)
        } else {
            format!("{PREAMBLE_MARKER}\n{user_text}")
        }
    }
}

/// Strips `<script>` blocks and surrounding whitespace from user input.
pub fn sanitize(raw: &str) -> String {
    SCRIPT_TAG.replace_all(raw, "").trim().to_string()
}
