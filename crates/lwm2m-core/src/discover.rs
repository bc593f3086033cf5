//! Discover response builder.
//!
//! Renders the object tree as a CoRE link-format listing. Output is
//! byte-exact and depends on the LwM2M generation:
//!
//! | generation | header          | `ver` attribute | `uri` attribute  |
//! |------------|-----------------|-----------------|------------------|
//! | 1.0        | `lwm2m="1.0"`   | `;ver="2.0"`    | never            |
//! | 1.1        | `</>;lwm2m=1.1` | `;ver=2.0`      | bootstrap only   |
//!
//! Only Bootstrap-Discover carries the header, as its first link. Entries
//! follow in ascending object id, then instance id, then resource id.
//! Operational Discover lists resources under every instance it shows,
//! except at the root.

use bytes::Bytes;
use lwm2m_proto::{Lwm2mVersion, Path, PathKind, ProtocolError};

use crate::{
    dm::{Instance, ObjectEntry, ObjectTree, Resource, oid, security, server},
    error::RequestError,
};

/// Object version assumed when an object declares none.
pub const DEFAULT_OBJECT_VERSION: &str = "1.0";

/// Visibility check for operational Discover: `(oid, iid)`, where `None`
/// asks about the object itself.
pub type Visibility<'a> = &'a dyn Fn(u16, Option<u16>) -> bool;

/// Who is asking.
#[derive(Clone, Copy)]
pub enum DiscoverMode<'a> {
    /// The bound bootstrap peer while Bootstrapping. Sees everything,
    /// plus `ssid`/`uri` attributes.
    Bootstrap,
    /// A regular server; sees what the predicate allows.
    Server(Visibility<'a>),
}

/// Builds one Discover response.
pub struct DiscoverBuilder<'a> {
    tree: &'a ObjectTree,
    version: Lwm2mVersion,
    mode: DiscoverMode<'a>,
}

impl<'a> DiscoverBuilder<'a> {
    /// Builder over a tree snapshot.
    pub fn new(tree: &'a ObjectTree, version: Lwm2mVersion, mode: DiscoverMode<'a>) -> Self {
        Self { tree, version, mode }
    }

    /// Render the listing for `scope`.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the scope does not exist or is not visible
    /// - `Protocol` if the scope is too deep for the mode
    pub fn build(&self, scope: &Path) -> Result<Bytes, RequestError> {
        let mut links = Vec::new();
        if matches!(self.mode, DiscoverMode::Bootstrap) {
            links.push(self.header());
        }

        match (scope.kind(), self.mode) {
            (PathKind::Root, _) => {
                for (oid, object) in self.tree.objects() {
                    if self.object_visible(oid) {
                        self.push_object(&mut links, oid, object, false);
                    }
                }
            },
            (PathKind::Object, _) => {
                let oid = scope_id(scope.object_id())?;
                let object = self.visible_object(scope, oid)?;
                let resources = matches!(self.mode, DiscoverMode::Server(_));
                self.push_object(&mut links, oid, object, resources);
            },
            (PathKind::Instance, DiscoverMode::Server(_)) => {
                let (oid, iid) = (scope_id(scope.object_id())?, scope_id(scope.instance_id())?);
                let instance = self.visible_instance(scope, oid, iid)?;
                links.push(format!("</{oid}/{iid}>"));
                push_resources(&mut links, oid, iid, instance);
            },
            (PathKind::Resource, DiscoverMode::Server(_)) => {
                let (oid, iid) = (scope_id(scope.object_id())?, scope_id(scope.instance_id())?);
                let rid = scope_id(scope.resource_id())?;
                let instance = self.visible_instance(scope, oid, iid)?;
                if !instance.contains_key(&rid) {
                    return Err(RequestError::NotFound(scope.clone()));
                }
                links.push(format!("</{oid}/{iid}/{rid}>"));
            },
            _ => {
                return Err(ProtocolError::UnsupportedTarget {
                    method: "Discover".to_string(),
                    target: scope.to_string(),
                }
                .into());
            },
        }

        Ok(Bytes::from(links.join(",")))
    }

    fn header(&self) -> String {
        match self.version {
            Lwm2mVersion::V1_0 => "lwm2m=\"1.0\"".to_string(),
            Lwm2mVersion::V1_1 => "</>;lwm2m=1.1".to_string(),
        }
    }

    fn object_visible(&self, oid: u16) -> bool {
        match self.mode {
            DiscoverMode::Bootstrap => true,
            DiscoverMode::Server(visible) => visible(oid, None),
        }
    }

    fn instance_visible(&self, oid: u16, iid: u16) -> bool {
        match self.mode {
            DiscoverMode::Bootstrap => true,
            DiscoverMode::Server(visible) => visible(oid, Some(iid)),
        }
    }

    fn visible_object(&self, scope: &Path, oid: u16) -> Result<&'a ObjectEntry, RequestError> {
        self.tree
            .object(oid)
            .filter(|_| self.object_visible(oid))
            .ok_or_else(|| RequestError::NotFound(scope.clone()))
    }

    fn visible_instance(
        &self,
        scope: &Path,
        oid: u16,
        iid: u16,
    ) -> Result<&'a Instance, RequestError> {
        self.tree
            .instance(oid, iid)
            .filter(|_| self.instance_visible(oid, iid))
            .ok_or_else(|| RequestError::NotFound(scope.clone()))
    }

    fn push_object(
        &self,
        links: &mut Vec<String>,
        oid: u16,
        object: &ObjectEntry,
        with_resources: bool,
    ) {
        let mut link = format!("</{oid}>");
        if let Some(version) = object.version().filter(|v| *v != DEFAULT_OBJECT_VERSION) {
            match self.version {
                Lwm2mVersion::V1_0 => link.push_str(&format!(";ver=\"{version}\"")),
                Lwm2mVersion::V1_1 => link.push_str(&format!(";ver={version}")),
            }
        }
        links.push(link);

        for (iid, instance) in object.instances() {
            if !self.instance_visible(oid, iid) {
                continue;
            }
            let mut link = format!("</{oid}/{iid}>");
            if matches!(self.mode, DiscoverMode::Bootstrap) {
                self.push_bootstrap_attributes(&mut link, oid, instance);
            }
            links.push(link);
            if with_resources {
                push_resources(links, oid, iid, instance);
            }
        }
    }

    fn push_bootstrap_attributes(&self, link: &mut String, oid: u16, instance: &Instance) {
        let ssid_rid = match oid {
            oid::SECURITY => Some(security::SHORT_SERVER_ID),
            oid::SERVER => Some(server::SHORT_SERVER_ID),
            _ => None,
        };
        if let Some(ssid) = ssid_rid.and_then(|rid| instance.get(&rid)).and_then(Resource::as_u64)
        {
            link.push_str(&format!(";ssid={ssid}"));
        }

        if oid == oid::SECURITY && self.version == Lwm2mVersion::V1_1 {
            if let Some(uri) = instance.get(&security::SERVER_URI).and_then(Resource::as_text) {
                link.push_str(&format!(";uri=\"{uri}\""));
            }
        }
    }
}

fn push_resources(links: &mut Vec<String>, oid: u16, iid: u16, instance: &Instance) {
    links.extend(instance.keys().map(|rid| format!("</{oid}/{iid}/{rid}>")));
}

fn scope_id(id: Option<u16>) -> Result<u16, RequestError> {
    id.ok_or_else(|| RequestError::Inconsistent { reason: "path arity and kind disagree".into() })
}
