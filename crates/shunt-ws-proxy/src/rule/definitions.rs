//! Wire format for handler definitions.
//!
//! Rule definitions travel as tagged JSON between the admin API and the
//! worker actually holding the sockets. Deserializing a definition
//! reattaches behavior by matching the tag to a handler constructor;
//! proxy configurations may arrive as references that are dereferenced
//! against the parameters the admin layer registered on this worker.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::net::dns::LookupOptions;
use crate::net::proxy::{ProxyConfig, ProxySetting};
use crate::ws::{
    CaSource, ClientCertificate, EchoHandler, ForwardingOptions, IgnoreHttpsErrors, ListenHandler,
    PassthroughHandler, PassthroughOptions, RejectHandler, UpdateHostHeader, WsHandler,
};

#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("unknown rule parameter reference: {0}")]
    UnknownParameter(String),
}

/// Values the admin layer registered for `paramReference` indirections.
#[derive(Debug, Default)]
pub struct RuleParameters {
    params: HashMap<String, ProxyConfig>,
}

impl RuleParameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, config: ProxyConfig) {
        self.params.insert(name.into(), config);
    }

    pub fn dereference(&self, name: &str) -> Result<ProxyConfig, DefinitionError> {
        self.params
            .get(name)
            .cloned()
            .ok_or_else(|| DefinitionError::UnknownParameter(name.to_string()))
    }
}

/// Serialized proxy configuration: a concrete setting, a reference to an
/// admin-registered parameter, or an ordered list of either.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProxyConfigDef {
    Reference {
        #[serde(rename = "paramReference")]
        param_reference: String,
    },
    Setting(ProxySetting),
    List(Vec<ProxyConfigDef>),
}

impl ProxyConfigDef {
    pub fn build(self, params: &RuleParameters) -> Result<ProxyConfig, DefinitionError> {
        Ok(match self {
            ProxyConfigDef::Reference { param_reference } => {
                params.dereference(&param_reference)?
            }
            ProxyConfigDef::Setting(setting) => ProxyConfig::Setting(setting),
            ProxyConfigDef::List(entries) => ProxyConfig::List(
                entries
                    .into_iter()
                    .map(|entry| entry.build(params))
                    .collect::<Result<_, _>>()?,
            ),
        })
    }
}

/// Serialized form of [`UpdateHostHeader`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UpdateHostHeaderDef {
    Flag(bool),
    Value(String),
}

/// Serialized forwarding rewrite.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardingDef {
    pub target_host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_host_header: Option<UpdateHostHeaderDef>,
}

impl From<ForwardingDef> for ForwardingOptions {
    fn from(def: ForwardingDef) -> Self {
        let update_host_header = match def.update_host_header {
            None | Some(UpdateHostHeaderDef::Flag(true)) => UpdateHostHeader::Auto,
            // Any explicit non-true flag means "do not touch".
            Some(UpdateHostHeaderDef::Flag(false)) => UpdateHostHeader::Preserve,
            Some(UpdateHostHeaderDef::Value(value)) => UpdateHostHeader::Custom(value),
        };
        ForwardingOptions {
            target_host: def.target_host,
            update_host_header,
        }
    }
}

/// Serialized pass-through connection options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PassthroughOptionsDef {
    /// `ignoreHostCertificateErrors` is the legacy name for this field.
    #[serde(default, alias = "ignoreHostCertificateErrors")]
    pub ignore_host_https_errors: IgnoreHttpsErrors,
    #[serde(default, rename = "trustAdditionalCAs")]
    pub trust_additional_cas: Vec<CaSource>,
    #[serde(default)]
    pub client_certificate_host_map: HashMap<String, ClientCertificate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_config: Option<ProxyConfigDef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lookup_options: Option<LookupOptions>,
}

impl PassthroughOptionsDef {
    pub fn build(self, params: &RuleParameters) -> Result<PassthroughOptions, DefinitionError> {
        Ok(PassthroughOptions {
            ignore_host_https_errors: self.ignore_host_https_errors,
            trust_additional_cas: self.trust_additional_cas,
            client_certificate_host_map: self.client_certificate_host_map,
            proxy_config: self
                .proxy_config
                .map(|config| config.build(params))
                .transpose()?,
            lookup_options: self.lookup_options,
        })
    }
}

fn default_reject_status() -> u16 {
    500
}

/// Serialized handler definition, dispatched on its `type` tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WsHandlerDef {
    #[serde(rename = "ws-passthrough")]
    Passthrough {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        forwarding: Option<ForwardingDef>,
        #[serde(flatten)]
        options: PassthroughOptionsDef,
    },
    #[serde(rename = "ws-echo")]
    Echo,
    #[serde(rename = "ws-listen")]
    Listen,
    #[serde(rename = "ws-reject")]
    Reject {
        #[serde(default = "default_reject_status", rename = "statusCode")]
        status_code: u16,
        #[serde(default, rename = "statusMessage", skip_serializing_if = "Option::is_none")]
        status_message: Option<String>,
        #[serde(default)]
        headers: Vec<(String, String)>,
        #[serde(default)]
        body: String,
    },
    #[serde(rename = "close-connection")]
    CloseConnection,
    #[serde(rename = "reset-connection")]
    ResetConnection,
    #[serde(rename = "timeout")]
    Timeout,
}

impl WsHandlerDef {
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Reattach behavior to a deserialized definition.
    pub fn build(self, params: &RuleParameters) -> Result<WsHandler, DefinitionError> {
        Ok(match self {
            WsHandlerDef::Passthrough {
                forwarding,
                options,
            } => WsHandler::Passthrough(PassthroughHandler::new(
                forwarding.map(Into::into),
                options.build(params)?,
            )),
            WsHandlerDef::Echo => WsHandler::Echo(EchoHandler),
            WsHandlerDef::Listen => WsHandler::Listen(ListenHandler),
            WsHandlerDef::Reject {
                status_code,
                status_message,
                headers,
                body,
            } => WsHandler::Reject(RejectHandler {
                status_code,
                status_message,
                headers,
                body,
            }),
            WsHandlerDef::CloseConnection => WsHandler::CloseConnection,
            WsHandlerDef::ResetConnection => WsHandler::ResetConnection,
            WsHandlerDef::Timeout => WsHandler::Timeout,
        })
    }
}
