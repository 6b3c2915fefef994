use pdf_layout_translator::languages::LanguageRegistry;
use pdf_layout_translator::settings::Settings;
use pdf_layout_translator::translations::{TOOL_NAME, TranslateOptions, render_system_prompt};

#[test]
fn system_prompt_snapshot() {
    let settings = Settings::builtin().unwrap();
    let options = TranslateOptions {
        lang: "zh-hant".to_string(),
        formality: "academic".to_string(),
    };
    let prompt =
        render_system_prompt(&options, TOOL_NAME, &settings, &LanguageRegistry::load()).unwrap();
    insta::assert_snapshot!(prompt);
}

#[test]
fn unknown_register_is_rejected() {
    let settings = Settings::builtin().unwrap();
    let options = TranslateOptions {
        lang: "zh-hant".to_string(),
        formality: "poetic".to_string(),
    };
    let err = render_system_prompt(&options, TOOL_NAME, &settings, &LanguageRegistry::load())
        .unwrap_err();
    assert!(err.to_string().contains("poetic"));
}
