use serde::{Deserialize, Serialize};

use crate::error::AppError;

pub const TITLE_COUNT: usize = 5;
pub const HASHTAG_COUNT: usize = 25;
pub const CAPTION_COUNT: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GenerationSettings {
    pub language: String,
    pub tone: String,
    pub audience: String,
    pub content_type: String,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            language: "english".to_string(),
            tone: "engaging".to_string(),
            audience: "general".to_string(),
            content_type: "general".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptionStyle {
    Modern,
    Funny,
    Mixed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caption {
    pub text: String,
    pub style: CaptionStyle,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedContent {
    pub titles: Vec<String>,
    pub description: String,
    pub hashtags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub captions: Option<Vec<Caption>>,
}

pub fn build_prompt(description: &str, settings: &GenerationSettings) -> String {
    format!(
        r##"You are PopMitra, an AI assistant that helps creators make their videos go viral.

Based on this content description: "{description}"

Write in {language} with a {tone} tone for a {audience} audience. The content category is {content_type}.

Please generate:
1. {titles} catchy, viral video titles (each should be engaging and click-worthy)
2. 1 SEO-optimized description (include hook line, keywords, call-to-action, and relevant emojis)
3. {hashtags} trending hashtags (mix of trending, niche, and general hashtags)
4. {captions} short captions, each tagged with a style of "modern", "funny" or "mixed"

Format your response as a valid JSON object with this structure:
{{
  "titles": ["title1", "title2", "title3", "title4", "title5"],
  "description": "optimized description with emojis and CTA",
  "hashtags": ["#hashtag1", "#hashtag2", "...", "#hashtag25"],
  "captions": [{{"text": "caption", "style": "modern"}}]
}}

Make sure the content is engaging, viral-worthy, and optimized for social media platforms."##,
        description = description.replace('"', "'"),
        language = settings.language,
        tone = settings.tone,
        audience = settings.audience,
        content_type = settings.content_type,
        titles = TITLE_COUNT,
        hashtags = HASHTAG_COUNT,
        captions = CAPTION_COUNT,
    )
}

/// Pulls the JSON object out of model text and checks its shape.
pub fn parse_generated(raw: &str) -> Result<GeneratedContent, AppError> {
    let start = raw.find('{');
    let end = raw.rfind('}');
    let json = match (start, end) {
        (Some(start), Some(end)) if start < end => &raw[start..=end],
        _ => return Err(AppError::InvalidUpstreamResponse("no JSON object in response".into())),
    };

    let content: GeneratedContent = serde_json::from_str(json)
        .map_err(|e| AppError::InvalidUpstreamResponse(e.to_string()))?;
    content.validate()?;
    Ok(content)
}

impl GeneratedContent {
    fn validate(&self) -> Result<(), AppError> {
        if self.titles.len() != TITLE_COUNT || self.titles.iter().any(|t| t.trim().is_empty()) {
            return Err(AppError::InvalidUpstreamResponse(format!(
                "expected {} titles, got {}",
                TITLE_COUNT,
                self.titles.len()
            )));
        }
        if self.description.trim().is_empty() {
            return Err(AppError::InvalidUpstreamResponse("empty description".into()));
        }
        if self.hashtags.is_empty() {
            return Err(AppError::InvalidUpstreamResponse("no hashtags".into()));
        }
        if let Some(captions) = &self.captions {
            if captions.iter().any(|c| c.text.trim().is_empty()) {
                return Err(AppError::InvalidUpstreamResponse("empty caption".into()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r##"{
        "titles": ["a", "b", "c", "d", "e"],
        "description": "Watch this 🔥",
        "hashtags": ["#one", "#two"],
        "captions": [{"text": "so fun", "style": "funny"}]
    }"##;

    #[test]
    fn test_parses_json_wrapped_in_prose() {
        let raw = format!("Sure! Here you go:\n```json\n{}\n```", VALID);
        let content = parse_generated(&raw).unwrap();
        assert_eq!(content.titles.len(), 5);
        assert_eq!(content.captions.unwrap()[0].style, CaptionStyle::Funny);
    }

    #[test]
    fn test_captions_are_optional() {
        let raw = r##"{"titles": ["a","b","c","d","e"], "description": "d", "hashtags": ["#x"]}"##;
        assert!(parse_generated(raw).unwrap().captions.is_none());
    }

    #[test]
    fn test_missing_hashtags_is_invalid() {
        let raw = r#"{"titles": ["a","b","c","d","e"], "description": "d"}"#;
        assert!(matches!(parse_generated(raw), Err(AppError::InvalidUpstreamResponse(_))));
    }

    #[test]
    fn test_wrong_title_count_is_invalid() {
        let raw = r##"{"titles": ["a","b"], "description": "d", "hashtags": ["#x"]}"##;
        assert!(matches!(parse_generated(raw), Err(AppError::InvalidUpstreamResponse(_))));
    }

    #[test]
    fn test_unknown_caption_style_is_invalid() {
        let raw = r##"{"titles": ["a","b","c","d","e"], "description": "d", "hashtags": ["#x"],
            "captions": [{"text": "t", "style": "sad"}]}"##;
        assert!(matches!(parse_generated(raw), Err(AppError::InvalidUpstreamResponse(_))));
    }

    #[test]
    fn test_text_without_json_is_invalid() {
        assert!(matches!(
            parse_generated("I can't help with that."),
            Err(AppError::InvalidUpstreamResponse(_))
        ));
    }

    #[test]
    fn test_prompt_carries_settings() {
        let settings = GenerationSettings {
            language: "hindi".into(),
            tone: "funny".into(),
            ..Default::default()
        };
        let prompt = build_prompt("my cat \"Mochi\" dancing", &settings);
        assert!(prompt.contains("in hindi with a funny tone"));
        assert!(prompt.contains("my cat 'Mochi' dancing"));
        assert!(prompt.contains("\"titles\""));
    }
}
