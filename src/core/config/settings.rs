use std::path::PathBuf;

use super::parsing::{
    env_flag, env_optional, env_or_default, parse_cors_origins, parse_environment, parse_f32,
    parse_llm_provider, parse_u16, parse_u32, parse_u64, parse_usize,
};
use super::types::{
    ApiSettings, CacheSettings, ConfigError, CorsSettings, DatabaseSettings, LlmProvider,
    LlmSettings, NotifierSettings, ResilienceSettings, RuntimeSettings, S3Settings, ServerHost,
    ServerPort, ServerSettings, Settings, StorageSettings, TelemetrySettings, WorkerSettings,
};

impl Settings {
    pub(crate) fn load() -> Result<Self, ConfigError> {
        let host = env_or_default("AUTOGRADER_HOST", "0.0.0.0");
        let port = env_or_default("AUTOGRADER_PORT", "8001");

        let environment = parse_environment(
            env_optional("AUTOGRADER_ENV").or_else(|| env_optional("ENVIRONMENT")),
        );
        let strict_config =
            env_flag("AUTOGRADER_STRICT_CONFIG", false) || environment.is_production();

        let project_name = env_or_default("PROJECT_NAME", "Autograder API");
        let version = env_or_default("VERSION", env!("CARGO_PKG_VERSION"));
        let api_v1_str = env_or_default("API_V1_STR", "/api/v1");

        let cors_origins = parse_cors_origins(env_optional("BACKEND_CORS_ORIGINS"))?;

        let postgres_server = env_or_default("POSTGRES_SERVER", "localhost");
        let postgres_port = parse_u16("POSTGRES_PORT", env_or_default("POSTGRES_PORT", "5432"))?;
        let postgres_user = env_or_default("POSTGRES_USER", "autograder");
        let postgres_password = env_or_default("POSTGRES_PASSWORD", "");
        let postgres_db = env_or_default("POSTGRES_DB", "autograder");
        let database_url = env_optional("DATABASE_URL");
        let max_connections =
            parse_u32("DATABASE_MAX_CONNECTIONS", env_or_default("DATABASE_MAX_CONNECTIONS", "10"))?;

        let provider = parse_llm_provider(env_or_default("LLM_PROVIDER", "openai"))?;
        let default_base_url = match provider {
            LlmProvider::OpenAi => "https://api.openai.com/v1",
            LlmProvider::Ollama => "http://localhost:11434",
        };
        let llm_base_url = env_or_default("LLM_BASE_URL", default_base_url);
        let llm_api_key = env_or_default("LLM_API_KEY", "");
        let llm_model = env_or_default("LLM_MODEL", "gpt-4o-mini");
        let llm_max_tokens = parse_u32("LLM_MAX_TOKENS", env_or_default("LLM_MAX_TOKENS", "2048"))?;
        let llm_temperature =
            parse_f32("LLM_TEMPERATURE", env_or_default("LLM_TEMPERATURE", "0.0"))?;
        let llm_request_timeout =
            parse_u64("LLM_REQUEST_TIMEOUT", env_or_default("LLM_REQUEST_TIMEOUT", "120"))?;

        let llm_breaker_threshold =
            parse_u32("LLM_BREAKER_THRESHOLD", env_or_default("LLM_BREAKER_THRESHOLD", "5"))?;
        let llm_breaker_cooldown_seconds = parse_u64(
            "LLM_BREAKER_COOLDOWN_SECONDS",
            env_or_default("LLM_BREAKER_COOLDOWN_SECONDS", "60"),
        )?;
        let retrieval_breaker_threshold = parse_u32(
            "RETRIEVAL_BREAKER_THRESHOLD",
            env_or_default("RETRIEVAL_BREAKER_THRESHOLD", "5"),
        )?;
        let retrieval_breaker_cooldown_seconds = parse_u64(
            "RETRIEVAL_BREAKER_COOLDOWN_SECONDS",
            env_or_default("RETRIEVAL_BREAKER_COOLDOWN_SECONDS", "30"),
        )?;
        let retry_max_attempts =
            parse_u32("RETRY_MAX_ATTEMPTS", env_or_default("RETRY_MAX_ATTEMPTS", "3"))?;
        let retry_base_delay_ms =
            parse_u64("RETRY_BASE_DELAY_MS", env_or_default("RETRY_BASE_DELAY_MS", "300"))?;
        let retry_max_delay_ms =
            parse_u64("RETRY_MAX_DELAY_MS", env_or_default("RETRY_MAX_DELAY_MS", "10000"))?;
        let retry_jitter = env_flag("RETRY_JITTER", true);

        let concurrency =
            parse_usize("WORKER_CONCURRENCY", env_or_default("WORKER_CONCURRENCY", "3"))?;
        let queue_capacity =
            parse_usize("QUEUE_CAPACITY", env_or_default("QUEUE_CAPACITY", "64"))?;
        let task_timeout_seconds =
            parse_u64("TASK_TIMEOUT_SECONDS", env_or_default("TASK_TIMEOUT_SECONDS", "900"))?;
        let persist_timeout_seconds = parse_u64(
            "PERSIST_TIMEOUT_SECONDS",
            env_or_default("PERSIST_TIMEOUT_SECONDS", "30"),
        )?;

        let cache_capacity =
            parse_usize("RAG_CACHE_CAPACITY", env_or_default("RAG_CACHE_CAPACITY", "32"))?;
        let top_k = parse_usize("RAG_TOP_K", env_or_default("RAG_TOP_K", "3"))?;

        let resources_dir = PathBuf::from(env_or_default("RESOURCES_DIR", "./resources"));

        let s3_endpoint = env_or_default("S3_ENDPOINT", "");
        let s3_access_key = env_or_default("S3_ACCESS_KEY", "");
        let s3_secret_key = env_or_default("S3_SECRET_KEY", "");
        let s3_bucket = env_or_default("S3_BUCKET", "");
        let s3_region = env_or_default("S3_REGION", "us-east-1");

        let result_webhook_url =
            env_optional("RESULT_WEBHOOK_URL").map(|url| url.trim_end_matches('/').to_string());

        let log_level = env_or_default("LOG_LEVEL", "info");
        let json = env_flag("LOG_JSON", false);
        let prometheus_enabled = env_flag("PROMETHEUS_ENABLED", false);

        let settings = Self {
            server: ServerSettings {
                host: ServerHost::parse(host)?,
                port: ServerPort::parse(port)?,
            },
            runtime: RuntimeSettings { environment, strict_config },
            api: ApiSettings { project_name, version, api_v1_str },
            cors: CorsSettings { origins: cors_origins },
            database: DatabaseSettings {
                postgres_server,
                postgres_port,
                postgres_user,
                postgres_password,
                postgres_db,
                database_url,
                max_connections,
            },
            llm: LlmSettings {
                provider,
                base_url: llm_base_url,
                api_key: llm_api_key,
                model: llm_model,
                max_tokens: llm_max_tokens,
                temperature: llm_temperature,
                request_timeout: llm_request_timeout,
            },
            resilience: ResilienceSettings {
                llm_breaker_threshold,
                llm_breaker_cooldown_seconds,
                retrieval_breaker_threshold,
                retrieval_breaker_cooldown_seconds,
                retry_max_attempts,
                retry_base_delay_ms,
                retry_max_delay_ms,
                retry_jitter,
            },
            worker: WorkerSettings {
                concurrency,
                queue_capacity,
                task_timeout_seconds,
                persist_timeout_seconds,
            },
            cache: CacheSettings { capacity: cache_capacity, top_k },
            storage: StorageSettings { resources_dir },
            s3: S3Settings {
                endpoint: s3_endpoint,
                access_key: s3_access_key,
                secret_key: s3_secret_key,
                bucket: s3_bucket,
                region: s3_region,
            },
            notifier: NotifierSettings { result_webhook_url },
            telemetry: TelemetrySettings { log_level, json, prometheus_enabled },
        };

        settings.validate()?;
        Ok(settings)
    }

    pub(crate) fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host.0, self.server.port.0)
    }

    pub(crate) fn server_host(&self) -> &str {
        &self.server.host.0
    }

    pub(crate) fn server_port(&self) -> u16 {
        self.server.port.0
    }

    pub(crate) fn api(&self) -> &ApiSettings {
        &self.api
    }

    pub(crate) fn cors(&self) -> &CorsSettings {
        &self.cors
    }

    pub(crate) fn database(&self) -> &DatabaseSettings {
        &self.database
    }

    pub(crate) fn llm(&self) -> &LlmSettings {
        &self.llm
    }

    pub(crate) fn resilience(&self) -> &ResilienceSettings {
        &self.resilience
    }

    pub(crate) fn worker(&self) -> &WorkerSettings {
        &self.worker
    }

    pub(crate) fn cache(&self) -> &CacheSettings {
        &self.cache
    }

    pub(crate) fn storage(&self) -> &StorageSettings {
        &self.storage
    }

    pub(crate) fn s3(&self) -> &S3Settings {
        &self.s3
    }

    pub(crate) fn notifier(&self) -> &NotifierSettings {
        &self.notifier
    }

    pub(crate) fn telemetry(&self) -> &TelemetrySettings {
        &self.telemetry
    }

    pub(crate) fn runtime(&self) -> &RuntimeSettings {
        &self.runtime
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let positive: [(&'static str, u64); 8] = [
            ("LLM_BREAKER_THRESHOLD", u64::from(self.resilience.llm_breaker_threshold)),
            ("RETRIEVAL_BREAKER_THRESHOLD", u64::from(self.resilience.retrieval_breaker_threshold)),
            ("RETRY_MAX_ATTEMPTS", u64::from(self.resilience.retry_max_attempts)),
            ("WORKER_CONCURRENCY", self.worker.concurrency as u64),
            ("QUEUE_CAPACITY", self.worker.queue_capacity as u64),
            ("TASK_TIMEOUT_SECONDS", self.worker.task_timeout_seconds),
            ("PERSIST_TIMEOUT_SECONDS", self.worker.persist_timeout_seconds),
            ("RAG_CACHE_CAPACITY", self.cache.capacity as u64),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::InvalidValue { field, value: "0".to_string() });
            }
        }

        if self.resilience.retry_max_delay_ms < self.resilience.retry_base_delay_ms {
            return Err(ConfigError::InvalidValue {
                field: "RETRY_MAX_DELAY_MS",
                value: self.resilience.retry_max_delay_ms.to_string(),
            });
        }

        if self.database.max_connections == 0 {
            return Err(ConfigError::InvalidValue {
                field: "DATABASE_MAX_CONNECTIONS",
                value: "0".to_string(),
            });
        }

        if !(self.runtime.strict_config || self.runtime.environment.is_production()) {
            return Ok(());
        }

        if self.database.database_url.is_none() && self.database.postgres_password.is_empty() {
            return Err(ConfigError::MissingSecret("POSTGRES_PASSWORD"));
        }
        if self.llm.provider == LlmProvider::OpenAi && self.llm.api_key.is_empty() {
            return Err(ConfigError::MissingSecret("LLM_API_KEY"));
        }
        if self.llm.base_url.is_empty() {
            return Err(ConfigError::MissingSecret("LLM_BASE_URL"));
        }

        Ok(())
    }
}
