//! Stage-specific instructions sent to the chat model.

use relingo_shared::Stage;

use crate::TransformError;

/// Instructions that move a chunk into `stage`.
///
/// `target_language` is required for [`Stage::Translated`] and
/// [`Stage::Improved`] and ignored for [`Stage::Cleaned`].
pub fn stage_prompt(
    stage: Stage,
    content: &str,
    target_language: Option<&str>,
) -> Result<String, TransformError> {
    match stage {
        Stage::Initial => Err(TransformError::InvalidRequest(
            "INITIAL is not a transform target".into(),
        )),
        Stage::Cleaned => Ok(clean_prompt(content)),
        Stage::Translated => Ok(translate_prompt(content, require_language(stage, target_language)?)),
        Stage::Improved => Ok(improve_prompt(content, require_language(stage, target_language)?)),
    }
}

fn require_language(stage: Stage, target_language: Option<&str>) -> Result<&str, TransformError> {
    target_language
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .ok_or_else(|| TransformError::InvalidRequest(format!("{stage} requires a target language")))
}

const HTML_ONLY: &str = "Answer with the resulting HTML only. Do not wrap it in quotes or code fences.";

fn clean_prompt(content: &str) -> String {
    format!(
        "HTML: '''{content}'''\n\n\
         Remove from this HTML:\n\
         - suggestions or links to other blog posts\n\
         - forms\n\
         - references to the original author or blog\n\n\
         Keep the language of the content unchanged and keep every remaining HTML tag.\n\
         {HTML_ONLY}"
    )
}

fn translate_prompt(content: &str, language: &str) -> String {
    format!(
        "HTML: '''{content}'''\n\
         Target language: '''{language}'''\n\n\
         Translate the HTML into the target language. Keep every HTML tag.\n\
         {HTML_ONLY}"
    )
}

fn improve_prompt(content: &str, language: &str) -> String {
    format!(
        "HTML: '''{content}'''\n\
         Target language: '''{language}'''\n\n\
         Rewrite the text so it reads naturally for native speakers of the target language \
         and is engaging and easy to read, while keeping the original meaning. Keep every HTML tag.\n\
         {HTML_ONLY}"
    )
}

/// Instructions for the final metadata call over the assembled article.
pub fn metadata_prompt(article_text: &str, language: &str) -> String {
    format!(
        "Article text: '''{article_text}'''\n\
         Target language: '''{language}'''\n\n\
         Suggest, in the target language and following SEO practice:\n\
         1. a title of about 55 characters that reflects the content\n\
         2. a metaDescription of about 150 characters\n\
         3. a short URL slug\n\n\
         Respond with a JSON object: {{\"title\": string, \"metaDescription\": string, \"slug\": string}}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_does_not_need_language() {
        let prompt = stage_prompt(Stage::Cleaned, "<p>x</p>", None).unwrap();
        assert!(prompt.contains("<p>x</p>"));
        assert!(!prompt.contains("Target language"));
    }

    #[test]
    fn translate_and_improve_embed_language() {
        for stage in [Stage::Translated, Stage::Improved] {
            let prompt = stage_prompt(stage, "<p>x</p>", Some("Spanish")).unwrap();
            assert!(prompt.contains("'''Spanish'''"), "{stage}");
        }
    }

    #[test]
    fn missing_language_is_invalid() {
        let err = stage_prompt(Stage::Translated, "<p>x</p>", Some("  ")).unwrap_err();
        assert!(matches!(err, TransformError::InvalidRequest(_)));
    }

    #[test]
    fn initial_is_not_a_target() {
        assert!(stage_prompt(Stage::Initial, "x", None).is_err());
    }

    #[test]
    fn metadata_prompt_names_fields() {
        let prompt = metadata_prompt("Hola", "Spanish");
        assert!(prompt.contains("metaDescription"));
        assert!(prompt.contains("\"slug\""));
    }
}
