//! Scenario normalization: maps free-form voice transcripts to canonical
//! scenario keys used by the cache, with time-of-day prompt enhancement.
//! Keys compare case-insensitively; canonicalization lowercases, trims and
//! collapses whitespace so equal requests land on the same cache entry.

use std::sync::OnceLock;

use regex::Regex;

fn whitespace_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").expect("whitespace regex is valid"))
}

/// A matched scenario: canonical prompt plus relative priority.
#[derive(Debug, Clone, PartialEq)]
pub struct Scenario {
    pub prompt: String,
    pub priority: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeOfDay {
    Morning,
    Afternoon,
    Evening,
    Night,
}

/// Keyword table: category → trigger words in the transcript.
const SCENARIO_KEYWORDS: &[(&str, &[&str])] = &[
    (
        "workout",
        &["workout", "exercise", "gym", "running", "training", "fitness"],
    ),
    (
        "relax",
        &["relax", "chill", "calm", "peaceful", "zen", "meditation"],
    ),
    (
        "focus",
        &["focus", "work", "study", "concentrate", "productive"],
    ),
    (
        "party",
        &["party", "dance", "celebration", "fun", "upbeat", "energy"],
    ),
    ("sleep", &["sleep", "bedtime", "night", "lullaby", "dreamy"]),
    (
        "morning",
        &["morning", "wake", "sunrise", "coffee", "breakfast"],
    ),
    ("evening", &["evening", "sunset", "dinner", "wind down"]),
];

/// Lowercase, trim and collapse internal whitespace.
pub fn canonicalize(input: &str) -> String {
    whitespace_re().replace_all(input.trim(), " ").to_lowercase()
}

/// Match the transcript against the keyword table. On a hit the scenario
/// prompt is the category followed by the canonicalized input.
pub fn match_scenario(input: &str) -> Option<Scenario> {
    let normalized = canonicalize(input);

    for (category, keywords) in SCENARIO_KEYWORDS {
        for keyword in *keywords {
            if normalized.contains(keyword) {
                return Some(Scenario {
                    prompt: format!("{category} {normalized}"),
                    priority: 1,
                });
            }
        }
    }

    None
}

/// Derive the cache key for a transcript: the matched scenario prompt when a
/// keyword hits, otherwise the canonicalized transcript itself.
pub fn scenario_key(input: &str) -> String {
    match match_scenario(input) {
        Some(scenario) => scenario.prompt,
        None => canonicalize(input),
    }
}

/// Bucket the given hour (0-23) into a time of day.
pub fn time_of_day_for_hour(hour: u32) -> TimeOfDay {
    match hour {
        5..=11 => TimeOfDay::Morning,
        12..=16 => TimeOfDay::Afternoon,
        17..=20 => TimeOfDay::Evening,
        _ => TimeOfDay::Night,
    }
}

/// Current local time of day.
pub fn time_of_day() -> TimeOfDay {
    use chrono::Timelike;
    time_of_day_for_hour(chrono::Local::now().hour())
}

/// Fallback scenario when the transcript matched nothing at all.
pub fn time_based_scenario(tod: TimeOfDay) -> Scenario {
    let prompt = match tod {
        TimeOfDay::Morning => "energizing morning music",
        TimeOfDay::Afternoon => "focused work music",
        TimeOfDay::Evening => "relaxing evening music",
        TimeOfDay::Night => "calm night music",
    };
    Scenario {
        prompt: prompt.to_string(),
        priority: 1,
    }
}

/// Prefix the prompt with the current time context unless it already has one.
pub fn enhance_prompt(user_prompt: &str, tod: TimeOfDay) -> String {
    let normalized = canonicalize(user_prompt);

    let has_time_context = ["morning", "afternoon", "evening", "night"]
        .iter()
        .any(|ctx| normalized.contains(ctx));

    if has_time_context {
        return normalized;
    }

    let context = match tod {
        TimeOfDay::Morning => "morning",
        TimeOfDay::Afternoon => "afternoon",
        TimeOfDay::Evening => "evening",
        TimeOfDay::Night => "night",
    };
    format!("{context} {normalized}")
}

/// Prompt suggestions for the current time of day.
pub fn suggestions(tod: TimeOfDay) -> Vec<&'static str> {
    match tod {
        TimeOfDay::Morning => vec!["morning workout", "energizing coffee time", "upbeat start"],
        TimeOfDay::Afternoon => vec![
            "focused work session",
            "afternoon productivity",
            "study music",
        ],
        TimeOfDay::Evening => vec!["relaxing evening", "chill dinner vibes", "sunset melodies"],
        TimeOfDay::Night => vec!["calm night sounds", "peaceful sleep", "dreamy ambience"],
    }
}
