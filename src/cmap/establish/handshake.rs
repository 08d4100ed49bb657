//! Builds the `client` metadata document sent with the handshake command and negotiates which
//! authentication mechanism a connection should use.

use std::env;

use bson::{doc, Document};

use crate::{
    cmap::Command,
    hello::{hello_command, HelloReply},
    options::{AuthMechanism, Credential, ServerApi},
};

const MAX_METADATA_SIZE: usize = 512;
const MAX_APP_NAME_SIZE: usize = 128;

/// The statically-known parts of the `client` metadata document, before any app name or
/// environment information is layered on.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct ClientMetadata {
    pub(crate) application_name: Option<String>,
    pub(crate) driver_name: String,
    pub(crate) driver_version: String,
    pub(crate) os_type: String,
    pub(crate) os_architecture: Option<String>,
    pub(crate) platform: String,
    pub(crate) env: Option<FaasEnvironment>,
}

/// The FaaS provider a process is running under, detected from well-known environment variables.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum FaasProvider {
    AwsLambda,
    AzureFunc,
    GcpFunc,
    Vercel,
}

impl FaasProvider {
    fn detect() -> Option<Self> {
        if var_set("VERCEL") {
            return Some(Self::Vercel);
        }
        if var_set("AWS_LAMBDA_RUNTIME_API")
            || env::var("AWS_EXECUTION_ENV")
                .map(|v| v.starts_with("AWS_Lambda_"))
                .unwrap_or(false)
        {
            return Some(Self::AwsLambda);
        }
        if var_set("FUNCTIONS_WORKER_RUNTIME") {
            return Some(Self::AzureFunc);
        }
        if var_set("K_SERVICE") || var_set("FUNCTION_NAME") {
            return Some(Self::GcpFunc);
        }
        None
    }

    fn name(&self) -> &'static str {
        match self {
            Self::AwsLambda => "aws.lambda",
            Self::AzureFunc => "azure.func",
            Self::GcpFunc => "gcp.func",
            Self::Vercel => "vercel",
        }
    }
}

fn var_set(name: &str) -> bool {
    env::var_os(name).is_some_and(|v| !v.is_empty())
}

/// The FaaS-specific fields reported in `env`, collected only when a provider is detected.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct FaasEnvironment {
    pub(crate) provider: FaasProvider,
    pub(crate) region: Option<String>,
    pub(crate) memory_mb: Option<i32>,
    pub(crate) timeout_sec: Option<i32>,
}

impl FaasEnvironment {
    fn detect() -> Option<Self> {
        let provider = FaasProvider::detect()?;
        let env = match provider {
            FaasProvider::AwsLambda => Self {
                provider,
                region: env::var("AWS_REGION").ok(),
                memory_mb: env::var("AWS_LAMBDA_FUNCTION_MEMORY_SIZE")
                    .ok()
                    .and_then(|s| s.parse().ok()),
                timeout_sec: None,
            },
            FaasProvider::GcpFunc => Self {
                provider,
                region: env::var("FUNCTION_REGION").ok(),
                memory_mb: env::var("FUNCTION_MEMORY_MB").ok().and_then(|s| s.parse().ok()),
                timeout_sec: env::var("FUNCTION_TIMEOUT_SEC").ok().and_then(|s| s.parse().ok()),
            },
            FaasProvider::Vercel => Self {
                provider,
                region: env::var("VERCEL_REGION").ok(),
                memory_mb: None,
                timeout_sec: None,
            },
            FaasProvider::AzureFunc => Self {
                provider,
                region: None,
                memory_mb: None,
                timeout_sec: None,
            },
        };
        Some(env)
    }

    fn into_document(self, include_details: bool) -> Document {
        let mut doc = doc! { "name": self.provider.name() };
        if include_details {
            if let Some(region) = self.region {
                doc.insert("region", region);
            }
            if let Some(memory_mb) = self.memory_mb {
                doc.insert("memory_mb", memory_mb);
            }
            if let Some(timeout_sec) = self.timeout_sec {
                doc.insert("timeout_sec", timeout_sec);
            }
        }
        doc
    }
}

/// How much of `ClientMetadata` to still serialize, from most to least detail. Applied in order
/// until the document fits within [`MAX_METADATA_SIZE`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Truncation {
    Full,
    NoPlatform,
    NoEnvDetails,
    NoEnv,
    NoOsDetails,
}

const TRUNCATIONS: [Truncation; 5] = [
    Truncation::Full,
    Truncation::NoPlatform,
    Truncation::NoEnvDetails,
    Truncation::NoEnv,
    Truncation::NoOsDetails,
];

impl ClientMetadata {
    pub(crate) fn new(app_name: Option<String>) -> crate::error::Result<Self> {
        if let Some(ref name) = app_name {
            if name.len() > MAX_APP_NAME_SIZE {
                return Err(crate::error::ErrorKind::InvalidApplicationName { len: name.len() }.into());
            }
        }

        Ok(Self {
            application_name: app_name,
            driver_name: "mongodb-core".to_string(),
            driver_version: env!("CARGO_PKG_VERSION").to_string(),
            os_type: std::env::consts::OS.to_string(),
            os_architecture: Some(std::env::consts::ARCH.to_string()),
            platform: format!("rustc / tokio"),
            env: FaasEnvironment::detect(),
        })
    }

    fn into_document(self, truncation: Truncation) -> Document {
        let mut doc = Document::new();

        if let Some(name) = self.application_name {
            doc.insert("application", doc! { "name": name });
        }

        doc.insert(
            "driver",
            doc! { "name": self.driver_name, "version": self.driver_version },
        );

        let mut os = doc! { "type": self.os_type.clone() };
        if truncation < Truncation::NoOsDetails {
            if let Some(arch) = self.os_architecture {
                os.insert("architecture", arch);
            }
        }
        doc.insert("os", os);

        if truncation < Truncation::NoPlatform {
            doc.insert("platform", self.platform);
        }

        if truncation < Truncation::NoEnv {
            if let Some(env) = self.env {
                doc.insert("env", env.into_document(truncation < Truncation::NoEnvDetails));
            }
        }

        doc
    }

    /// Serializes this metadata, trimming detail (platform -> env.* -> os architecture) until
    /// the resulting document is at most [`MAX_METADATA_SIZE`] bytes.
    pub(crate) fn into_bounded_document(self) -> crate::error::Result<Document> {
        for truncation in TRUNCATIONS {
            let doc = self.clone().into_document(truncation);
            let size = crate::bson_util::to_document_bytes(&doc)?.len();
            if size <= MAX_METADATA_SIZE || truncation == Truncation::NoOsDetails {
                return Ok(doc);
            }
        }
        unreachable!("NoOsDetails is always tried last")
    }
}

/// Builds the `hello`/legacy-hello command sent as the first message on a new connection,
/// attaching the client metadata document and, if a credential is configured, the
/// `saslSupportedMechs` probe used to negotiate a mechanism.
pub(crate) fn handshake_command(
    app_name: Option<String>,
    server_api: Option<&ServerApi>,
    load_balanced: bool,
    credential: Option<&Credential>,
) -> crate::error::Result<Command> {
    let mut command = hello_command(server_api, Some(load_balanced), None, None);

    if load_balanced {
        command.body.insert("loadBalanced", true);
    }

    if let Some(credential) = credential {
        if let Some(username) = &credential.username {
            command.body.insert(
                "saslSupportedMechs",
                format!("{}.{}", credential.source_or_default(), username),
            );
        }
    }

    let metadata = ClientMetadata::new(app_name)?;
    command.body.insert("client", metadata.into_bounded_document()?);

    // No compression codec is implemented, so the list advertised to the server is always
    // empty; the server's reply is still recorded on the StreamDescription for completeness.
    command
        .body
        .insert("compression", Vec::<String>::new());

    Ok(command)
}

/// Selects the auth mechanism to use given the handshake reply and the configured credential,
/// following the preference order SCRAM-SHA-256, SCRAM-SHA-1, MONGODB-CR (legacy servers only).
pub(crate) fn negotiate_auth_mechanism(
    credential: &Credential,
    reply: &HelloReply,
) -> AuthMechanism {
    if let Some(ref mechanism) = credential.mechanism {
        return mechanism.clone();
    }

    let max_wire_version = reply.command_response.max_wire_version.unwrap_or(0);
    let supported = reply
        .command_response
        .sasl_supported_mechs
        .as_ref()
        .map(|mechs| mechs.iter().any(|m| m == "SCRAM-SHA-256"));

    match supported {
        Some(true) => AuthMechanism::ScramSha256,
        Some(false) => AuthMechanism::ScramSha1,
        None if max_wire_version <= 2 => AuthMechanism::MongoDbCr,
        // A server old enough to omit saslSupportedMechs but past wire version 2 (3.0-3.6)
        // can't speak SCRAM-SHA-256.
        None => AuthMechanism::ScramSha1,
    }
}
