//! Object references: what a caller invokes on.
//!
//! A [`Reference`] is immutable and cheap to clone. Builder-style `with_*`
//! methods return a new reference and leave the original untouched.
//!
//! Stringified forms:
//! - `printer:tcp -h 10.0.0.1 -p 4061:tcp -h 10.0.0.2 -p 4061` (direct)
//! - `printer@PrinterAdapter` (indirect through an adapter id)
//! - `printer` (well-known object, resolved by identity)

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::endpoint::{parse_endpoint_list, EndpointDescriptor, EndpointSelection};
use crate::{RemotingError, Result};

/// Object identity; compared and hashed by value
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Identity {
    pub name: String,
    pub category: String,
}

impl Identity {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            category: String::new(),
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.category.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.category, self.name)
        }
    }
}

impl FromStr for Identity {
    type Err = RemotingError;

    fn from_str(s: &str) -> Result<Self> {
        let (category, name) = match s.split_once('/') {
            Some((category, name)) => (category, name),
            None => ("", s),
        };
        if name.is_empty() {
            return Err(RemotingError::configuration(
                format!("identity '{}' has an empty name", s),
                Some("identity"),
            ));
        }
        Ok(Identity::new(name).with_category(category))
    }
}

/// How a request travels and whether a reply is expected
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum InvocationMode {
    #[default]
    Twoway,
    Oneway,
    /// Queued on the connection until the batch is flushed
    Batch,
    Datagram,
}

impl InvocationMode {
    pub fn expects_reply(&self) -> bool {
        matches!(self, InvocationMode::Twoway)
    }

    pub fn is_batch(&self) -> bool {
        matches!(self, InvocationMode::Batch)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InvocationMode::Twoway => "twoway",
            InvocationMode::Oneway => "oneway",
            InvocationMode::Batch => "batch",
            InvocationMode::Datagram => "datagram",
        }
    }
}

/// Encoding version carried with every request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EncodingVersion {
    pub major: u8,
    pub minor: u8,
}

impl Default for EncodingVersion {
    fn default() -> Self {
        Self { major: 1, minor: 1 }
    }
}

impl fmt::Display for EncodingVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Request context; ordered so encodings are deterministic
pub type Context = BTreeMap<String, String>;

/// Where the target object lives
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    /// Endpoints carried in the reference itself
    Direct(Vec<EndpointDescriptor>),
    /// Resolved through the location service by adapter id
    Adapter(String),
    /// Resolved through the location service by object identity
    WellKnown,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ReferenceData {
    identity: Identity,
    facet: Option<String>,
    target: Target,
    mode: InvocationMode,
    encoding: EncodingVersion,
    context: Context,
    locator_cache_timeout: Option<Duration>,
    endpoint_selection: EndpointSelection,
}

/// Immutable descriptor of a remote object
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Reference {
    inner: Arc<ReferenceData>,
}

impl Reference {
    fn from_target(identity: Identity, target: Target) -> Self {
        Self {
            inner: Arc::new(ReferenceData {
                identity,
                facet: None,
                target,
                mode: InvocationMode::default(),
                encoding: EncodingVersion::default(),
                context: Context::new(),
                locator_cache_timeout: None,
                endpoint_selection: EndpointSelection::default(),
            }),
        }
    }

    /// Reference carrying its own endpoints
    pub fn direct(identity: Identity, endpoints: Vec<EndpointDescriptor>) -> Self {
        Self::from_target(identity, Target::Direct(endpoints))
    }

    /// Reference resolved through an adapter id
    pub fn indirect(identity: Identity, adapter_id: impl Into<String>) -> Self {
        Self::from_target(identity, Target::Adapter(adapter_id.into()))
    }

    /// Reference resolved by looking up the identity itself
    pub fn well_known(identity: Identity) -> Self {
        Self::from_target(identity, Target::WellKnown)
    }

    pub fn identity(&self) -> &Identity {
        &self.inner.identity
    }

    pub fn facet(&self) -> Option<&str> {
        self.inner.facet.as_deref()
    }

    pub fn target(&self) -> &Target {
        &self.inner.target
    }

    pub fn mode(&self) -> InvocationMode {
        self.inner.mode
    }

    pub fn encoding(&self) -> EncodingVersion {
        self.inner.encoding
    }

    pub fn context(&self) -> &Context {
        &self.inner.context
    }

    pub fn locator_cache_timeout(&self) -> Option<Duration> {
        self.inner.locator_cache_timeout
    }

    pub fn endpoint_selection(&self) -> EndpointSelection {
        self.inner.endpoint_selection
    }

    /// Endpoints carried directly, if any
    pub fn endpoints(&self) -> Option<&[EndpointDescriptor]> {
        match &self.inner.target {
            Target::Direct(endpoints) => Some(endpoints),
            _ => None,
        }
    }

    pub fn adapter_id(&self) -> Option<&str> {
        match &self.inner.target {
            Target::Adapter(adapter) => Some(adapter),
            _ => None,
        }
    }

    pub fn is_indirect(&self) -> bool {
        !matches!(self.inner.target, Target::Direct(_))
    }

    fn map(&self, f: impl FnOnce(&mut ReferenceData)) -> Self {
        let mut data = (*self.inner).clone();
        f(&mut data);
        Self {
            inner: Arc::new(data),
        }
    }

    pub fn with_mode(&self, mode: InvocationMode) -> Self {
        self.map(|data| data.mode = mode)
    }

    pub fn with_facet(&self, facet: impl Into<String>) -> Self {
        let facet = facet.into();
        self.map(|data| data.facet = if facet.is_empty() { None } else { Some(facet) })
    }

    pub fn with_context(&self, context: Context) -> Self {
        self.map(|data| data.context = context)
    }

    pub fn with_encoding(&self, encoding: EncodingVersion) -> Self {
        self.map(|data| data.encoding = encoding)
    }

    /// `None` uses the runtime default; zero bypasses the cache
    pub fn with_locator_cache_timeout(&self, timeout: Option<Duration>) -> Self {
        self.map(|data| data.locator_cache_timeout = timeout)
    }

    pub fn with_endpoint_selection(&self, selection: EndpointSelection) -> Self {
        self.map(|data| data.endpoint_selection = selection)
    }

    pub fn with_endpoints(&self, endpoints: Vec<EndpointDescriptor>) -> Self {
        self.map(|data| data.target = Target::Direct(endpoints))
    }

    pub fn with_adapter_id(&self, adapter_id: impl Into<String>) -> Self {
        let adapter_id = adapter_id.into();
        self.map(|data| data.target = Target::Adapter(adapter_id))
    }
}

impl fmt::Debug for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reference")
            .field("identity", &self.inner.identity)
            .field("target", &self.inner.target)
            .field("mode", &self.inner.mode)
            .finish()
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner.identity)?;
        match &self.inner.target {
            Target::Direct(endpoints) => {
                for endpoint in endpoints {
                    write!(f, ":{}", endpoint)?;
                }
                Ok(())
            }
            Target::Adapter(adapter) => write!(f, "@{}", adapter),
            Target::WellKnown => Ok(()),
        }
    }
}

impl FromStr for Reference {
    type Err = RemotingError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some((identity, adapter)) = s.split_once('@') {
            let adapter = adapter.trim();
            if adapter.is_empty() {
                return Err(RemotingError::configuration(
                    format!("proxy '{}' has an empty adapter id", s),
                    Some("proxy"),
                ));
            }
            return Ok(Reference::indirect(identity.trim().parse()?, adapter));
        }

        match s.split_once(':') {
            Some((identity, endpoints)) => {
                let endpoints = parse_endpoint_list(endpoints)?;
                if endpoints.is_empty() {
                    return Err(RemotingError::configuration(
                        format!("proxy '{}' has no endpoints", s),
                        Some("proxy"),
                    ));
                }
                Ok(Reference::direct(identity.trim().parse()?, endpoints))
            }
            None => Ok(Reference::well_known(s.parse()?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_direct_reference() {
        let reference: Reference = "printer:tcp -h a -p 1:tcp -h b -p 2".parse().unwrap();
        assert_eq!(reference.identity(), &Identity::new("printer"));
        assert_eq!(reference.endpoints().unwrap().len(), 2);
        assert!(!reference.is_indirect());
        assert_eq!(reference.to_string(), "printer:tcp -h a -p 1:tcp -h b -p 2");
    }

    #[test]
    fn test_ipv6_direct_reference_round_trips() {
        let reference = Reference::direct(
            Identity::new("printer").with_category("ops"),
            vec![EndpointDescriptor::tcp("::1", 4061), EndpointDescriptor::tcp("10.0.0.5", 4062)],
        );
        let text = reference.to_string();
        assert_eq!(text, "ops/printer:tcp -h \"::1\" -p 4061:tcp -h 10.0.0.5 -p 4062");

        let parsed: Reference = text.parse().unwrap();
        assert_eq!(parsed, reference);
    }

    #[test]
    fn test_parse_indirect_and_well_known() {
        let indirect: Reference = "ops/printer@PrinterAdapter".parse().unwrap();
        assert_eq!(indirect.identity().category, "ops");
        assert_eq!(indirect.adapter_id(), Some("PrinterAdapter"));
        assert!(indirect.is_indirect());

        let well_known: Reference = "printer".parse().unwrap();
        assert_eq!(well_known.target(), &Target::WellKnown);
        assert!(well_known.is_indirect());
    }

    #[test]
    fn test_parse_rejects_malformed_proxies() {
        assert!("printer@".parse::<Reference>().is_err());
        assert!("printer:".parse::<Reference>().is_err());
        assert!("ops/".parse::<Reference>().is_err());
    }

    #[test]
    fn test_with_methods_do_not_mutate_original() {
        let original = Reference::indirect(Identity::new("counter"), "CounterAdapter");
        let oneway = original.with_mode(InvocationMode::Oneway);

        assert_eq!(original.mode(), InvocationMode::Twoway);
        assert_eq!(oneway.mode(), InvocationMode::Oneway);
        assert_ne!(original, oneway);

        let mut context = Context::new();
        context.insert("trace".to_string(), "abc".to_string());
        let with_context = oneway.with_context(context.clone()).with_facet("admin");
        assert_eq!(with_context.context(), &context);
        assert_eq!(with_context.facet(), Some("admin"));
        assert!(oneway.context().is_empty());
    }

    #[test]
    fn test_mode_reply_expectations() {
        assert!(InvocationMode::Twoway.expects_reply());
        assert!(!InvocationMode::Oneway.expects_reply());
        assert!(!InvocationMode::Datagram.expects_reply());
        assert!(InvocationMode::Batch.is_batch());
    }
}
