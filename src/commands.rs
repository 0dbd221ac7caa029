use regex::{Regex, RegexBuilder};
use serde::Serialize;

/// Whether a command accepts a `$SYMBOL` argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolPolicy {
    Required,
    Optional,
    Disallowed,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandDefinition {
    pub name: &'static str,
    pub aliases: &'static [&'static str],
    pub symbol: SymbolPolicy,
    pub description: &'static str,
}

/// A detected tool invocation, before it is bound to a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolMatch {
    pub tool: &'static str,
    pub symbol: Option<String>,
}

impl ToolMatch {
    pub fn into_command(self, correlation_id: impl Into<String>) -> ToolCommand {
        ToolCommand {
            tool: self.tool.to_string(),
            symbol: self.symbol,
            id: correlation_id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    pub tool: String,
    pub symbol: Option<String>,
    pub id: String,
}

pub fn builtin_commands() -> Vec<CommandDefinition> {
    vec![
        CommandDefinition {
            name: "crypto-chart",
            aliases: &["chart"],
            symbol: SymbolPolicy::Required,
            description: "/chart $SYMBOL - Show a crypto price chart for a symbol (e.g. /chart $BTC)",
        },
        CommandDefinition {
            name: "crypto-price",
            aliases: &["price"],
            symbol: SymbolPolicy::Required,
            description: "/price $SYMBOL - Show the current price for a symbol (e.g. /price $ETH)",
        },
        CommandDefinition {
            name: "crypto-news",
            aliases: &["news"],
            symbol: SymbolPolicy::Optional,
            description: "/news or /news $SYMBOL - Show the latest crypto news, overall or for one symbol",
        },
        CommandDefinition {
            name: "crypto-screener",
            aliases: &["screener"],
            symbol: SymbolPolicy::Disallowed,
            description: "/screener - Show a crypto market screener for meme coins",
        },
        CommandDefinition {
            name: "market-heatmap",
            aliases: &["heatmap"],
            symbol: SymbolPolicy::Disallowed,
            description: "/heatmap - Show the crypto market heatmap",
        },
        CommandDefinition {
            name: "market-overview",
            aliases: &["overview"],
            symbol: SymbolPolicy::Disallowed,
            description: "/overview - Show an overview of the crypto market",
        },
        CommandDefinition {
            name: "market-trending",
            aliases: &["trending"],
            symbol: SymbolPolicy::Disallowed,
            description: "/trending - Show trending crypto assets",
        },
        CommandDefinition {
            name: "market-screener",
            aliases: &["marketScreener"],
            symbol: SymbolPolicy::Disallowed,
            description: "/marketScreener - Show a full crypto market screener",
        },
        CommandDefinition {
            name: "ticker-tape",
            aliases: &["tape"],
            symbol: SymbolPolicy::Disallowed,
            description: "/tape - Show a ticker tape of major crypto prices",
        },
    ]
}

/// Matches raw chat input against the command registry.
///
/// Built once at startup and shared read-only between requests.
pub struct CommandRegistry {
    commands: Vec<CommandDefinition>,
    slash_with_symbol: Regex,
    natural_language: Regex,
    slash_bare: Regex,
}

impl CommandRegistry {
    pub fn new(commands: Vec<CommandDefinition>) -> Result<Self, regex::Error> {
        let mut aliases: Vec<&str> = commands
            .iter()
            .flat_map(|c| c.aliases.iter().copied())
            .collect();
        // Longest first so `marketScreener` is never shadowed by `screener`.
        aliases.sort_by_key(|a| std::cmp::Reverse(a.len()));
        let alternation = aliases
            .iter()
            .map(|a| regex::escape(a))
            .collect::<Vec<_>>()
            .join("|");

        let build = |pattern: String| {
            RegexBuilder::new(&pattern).case_insensitive(true).build()
        };

        Ok(Self {
            slash_with_symbol: build(format!(r"^/({alternation})\s+\$(\w+)"))?,
            natural_language: build(format!(r"\b({alternation})\s+(?:for\s+)?\$(\w+)"))?,
            slash_bare: build(format!(r"^/({alternation})$"))?,
            commands,
        })
    }

    pub fn builtin() -> Self {
        // The builtin aliases are plain words, so the patterns always compile.
        Self::new(builtin_commands()).expect("builtin command patterns are valid")
    }

    pub fn commands(&self) -> &[CommandDefinition] {
        &self.commands
    }

    pub fn detect(&self, raw: &str) -> Option<ToolMatch> {
        let raw = raw.trim();

        if let Some(caps) = self.slash_with_symbol.captures(raw) {
            if let Some(found) = self.resolve(&caps[1], Some(&caps[2])) {
                return Some(found);
            }
        }

        if let Some(caps) = self.natural_language.captures(raw) {
            if let Some(found) = self.resolve(&caps[1], Some(&caps[2])) {
                return Some(found);
            }
        }

        if let Some(caps) = self.slash_bare.captures(raw) {
            let command = self.lookup(&caps[1])?;
            if command.symbol != SymbolPolicy::Required {
                return Some(ToolMatch {
                    tool: command.name,
                    symbol: None,
                });
            }
        }

        None
    }

    fn resolve(&self, alias: &str, symbol: Option<&str>) -> Option<ToolMatch> {
        let command = self.lookup(alias)?;
        let symbol = match command.symbol {
            SymbolPolicy::Disallowed => None,
            SymbolPolicy::Required | SymbolPolicy::Optional => symbol.map(str::to_uppercase),
        };
        Some(ToolMatch {
            tool: command.name,
            symbol,
        })
    }

    fn lookup(&self, alias: &str) -> Option<&CommandDefinition> {
        self.commands
            .iter()
            .find(|c| c.aliases.iter().any(|a| a.eq_ignore_ascii_case(alias)))
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}
