// Fixed option tables shown on the page and checked by the session.

/// Preset value meaning "no preset chosen".
pub const NONE_SELECTED: &str = "none selected";

pub const EMOTION_PRESETS: [&str; 14] = [
    "joy",
    "calm",
    "excitement",
    "gratitude",
    "sadness",
    "anxiety",
    "depression",
    "loneliness",
    "anger",
    "burnout",
    "confusion",
    "helplessness",
    "stress",
    "worry",
];

/// Model ids offered under the advanced options; the first one is the default.
pub const MODEL_OPTIONS: [&str; 3] = ["gpt-4o-mini", "gpt-4.1-mini", "gpt-3.5-turbo"];

pub const TEMPERATURE_MIN: f32 = 0.0;
pub const TEMPERATURE_MAX: f32 = 1.2;
pub const TEMPERATURE_STEP: f32 = 0.1;
pub const DEFAULT_TEMPERATURE: f32 = 0.8;

pub const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";

pub const CREDENTIAL_NOTICE: &str = "Enter your OpenAI API key to continue.";
pub const EMOTION_NOTICE: &str = "First choose or type your current emotion above.";
pub const FOLLOW_UP_TIP: &str =
    "Tip: if your feelings change, update the emotion above. The tone of the replies changes with it.";

lazy_static::lazy_static! {
    // Tick marks for the temperature slider: 0.0, 0.1, ..., 1.2
    pub static ref TEMPERATURE_TICKS: Vec<f32> = {
        let steps = ((TEMPERATURE_MAX - TEMPERATURE_MIN) / TEMPERATURE_STEP).round() as u32;
        (0..=steps)
            .map(|i| ((TEMPERATURE_MIN + i as f32 * TEMPERATURE_STEP) * 10.0).round() / 10.0)
            .collect()
    };
}
