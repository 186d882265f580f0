use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ProxyError;

/// The six supported analysis styles.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisMethod {
    /// Archetypes and symbols from a Jungian view.
    Jungian,
    /// Repressed wishes and conflicts from a Freudian view.
    Freudian,
    /// One or two words naming the dominant emotion.
    Sentiment,
    Archetypes,
    /// A reflective "what if?" question.
    WhatIf,
    Poem,
}

impl AnalysisMethod {
    pub const ALL: [AnalysisMethod; 6] = [
        Self::Jungian,
        Self::Freudian,
        Self::Sentiment,
        Self::Archetypes,
        Self::WhatIf,
        Self::Poem,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Jungian => "jungian",
            Self::Freudian => "freudian",
            Self::Sentiment => "sentiment",
            Self::Archetypes => "archetypes",
            Self::WhatIf => "what_if",
            Self::Poem => "poem",
        }
    }

    /// Display title for notifications.
    pub fn title(&self) -> &'static str {
        match self {
            Self::Jungian => "Jungian analysis",
            Self::Freudian => "Freudian analysis",
            Self::Sentiment => "Sentiment analysis",
            Self::Archetypes => "Archetype analysis",
            Self::WhatIf => "What-if question",
            Self::Poem => "Dream poem",
        }
    }

    /// Fixed instruction template prepended to the dream text.
    pub fn instruction(&self) -> &'static str {
        match self {
            Self::Jungian => {
                "Analyze the following dream from a Jungian perspective. Identify the most \
                 important archetypes and symbols and their meaning for the unconscious. Explain \
                 what the dream may be saying about personal development."
            }
            Self::Freudian => {
                "Analyze this dream from a Freudian perspective. Examine possible repressed \
                 wishes, drives and unconscious conflicts. Explain the symbolic meaning of the \
                 dream elements."
            }
            Self::Sentiment => {
                "Analyze the primary emotion and mood of this dream. Answer with only one or two \
                 words describing the main emotion (e.g. 'fear', 'joy', 'confusion', 'longing')."
            }
            Self::Archetypes => {
                "Identify the Jungian archetypes in this dream. Explain which archetypes (such as \
                 anima/animus, shadow, self, hero, wise old man) are present and what they mean."
            }
            Self::WhatIf => {
                "Based on this dream, ask one profound 'what if?' question that invites \
                 self-reflection. The question should lead the dreamer to think about their \
                 life, decisions or feelings."
            }
            Self::Poem => {
                "Turn this dream into a short, expressive poem. Keep the essence and mood of the \
                 dream, but make it poetic and metaphorical."
            }
        }
    }
}

impl fmt::Display for AnalysisMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnalysisMethod {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| ProxyError::InvalidMethod(s.to_string()))
    }
}
