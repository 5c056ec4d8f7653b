mod parsing;
mod settings;
mod types;

pub(crate) use types::{
    ApiSettings, CacheSettings, ConfigError, CorsSettings, DatabaseSettings, Environment,
    LlmProvider, LlmSettings, NotifierSettings, ResilienceSettings, RuntimeSettings, S3Settings,
    Settings, StorageSettings, TelemetrySettings, WorkerSettings,
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;

    #[tokio::test]
    async fn defaults_load_in_development() {
        let _guard = test_support::env_lock().await;
        test_support::clear_settings_env();

        let settings = Settings::load().expect("settings");
        assert_eq!(settings.server_port(), 8001);
        assert_eq!(settings.runtime().environment, Environment::Development);
        assert_eq!(settings.llm().provider, LlmProvider::OpenAi);
        assert_eq!(settings.resilience().llm_breaker_threshold, 5);
        assert_eq!(settings.resilience().retry_max_attempts, 3);
        assert_eq!(settings.worker().concurrency, 3);
        assert_eq!(settings.worker().persist_timeout(), std::time::Duration::from_secs(30));
        assert_eq!(settings.cache().capacity, 32);
        assert_eq!(settings.cache().top_k, 3);
    }

    #[tokio::test]
    async fn zero_breaker_threshold_is_rejected() {
        let _guard = test_support::env_lock().await;
        test_support::clear_settings_env();
        std::env::set_var("LLM_BREAKER_THRESHOLD", "0");

        let err = Settings::load().expect_err("zero threshold");
        assert!(matches!(err, ConfigError::InvalidValue { field: "LLM_BREAKER_THRESHOLD", .. }));

        test_support::clear_settings_env();
    }

    #[tokio::test]
    async fn zero_worker_concurrency_is_rejected() {
        let _guard = test_support::env_lock().await;
        test_support::clear_settings_env();
        std::env::set_var("WORKER_CONCURRENCY", "0");

        let err = Settings::load().expect_err("zero concurrency");
        assert!(matches!(err, ConfigError::InvalidValue { field: "WORKER_CONCURRENCY", .. }));

        test_support::clear_settings_env();
    }

    #[tokio::test]
    async fn zero_persist_timeout_is_rejected() {
        let _guard = test_support::env_lock().await;
        test_support::clear_settings_env();
        std::env::set_var("PERSIST_TIMEOUT_SECONDS", "0");

        let err = Settings::load().expect_err("zero persist timeout");
        assert!(matches!(err, ConfigError::InvalidValue { field: "PERSIST_TIMEOUT_SECONDS", .. }));

        test_support::clear_settings_env();
    }

    #[tokio::test]
    async fn strict_mode_requires_llm_credentials() {
        let _guard = test_support::env_lock().await;
        test_support::clear_settings_env();
        std::env::set_var("AUTOGRADER_STRICT_CONFIG", "true");
        std::env::set_var("DATABASE_URL", "postgresql://grader@localhost/grader");

        let err = Settings::load().expect_err("missing llm key");
        assert!(matches!(err, ConfigError::MissingSecret("LLM_API_KEY")));

        test_support::clear_settings_env();
    }

    #[tokio::test]
    async fn ollama_provider_does_not_need_api_key() {
        let _guard = test_support::env_lock().await;
        test_support::clear_settings_env();
        std::env::set_var("AUTOGRADER_STRICT_CONFIG", "1");
        std::env::set_var("DATABASE_URL", "postgresql://grader@localhost/grader");
        std::env::set_var("LLM_PROVIDER", "ollama");
        std::env::set_var("LLM_BASE_URL", "http://localhost:11434");

        let settings = Settings::load().expect("settings");
        assert_eq!(settings.llm().provider, LlmProvider::Ollama);

        test_support::clear_settings_env();
    }

    #[tokio::test]
    async fn invalid_port_is_reported() {
        let _guard = test_support::env_lock().await;
        test_support::clear_settings_env();
        std::env::set_var("AUTOGRADER_PORT", "not-a-port");

        let err = Settings::load().expect_err("bad port");
        assert!(matches!(err, ConfigError::InvalidPort(_)));

        test_support::clear_settings_env();
    }
}
