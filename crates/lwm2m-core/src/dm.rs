//! Object / instance / resource tree.
//!
//! The tree is owned by the device and mutated only by admitted, authorized
//! requests. All levels are `BTreeMap`s, so every iteration (Discover in
//! particular) is in ascending numeric id order no matter in which order
//! entries were created.

use std::collections::BTreeMap;

use bytes::Bytes;
use lwm2m_proto::Path;

use crate::error::RequestError;

/// Well-known object ids.
pub mod oid {
    /// LwM2M Security.
    pub const SECURITY: u16 = 0;
    /// LwM2M Server.
    pub const SERVER: u16 = 1;
    /// Access Control.
    pub const ACCESS_CONTROL: u16 = 2;
    /// Device.
    pub const DEVICE: u16 = 3;
}

/// Security object resource ids.
pub mod security {
    /// LwM2M Server URI.
    pub const SERVER_URI: u16 = 0;
    /// Bootstrap-Server flag.
    pub const BOOTSTRAP_SERVER: u16 = 1;
    /// Security Mode.
    pub const SECURITY_MODE: u16 = 2;
    /// Short Server ID.
    pub const SHORT_SERVER_ID: u16 = 10;
}

/// Server object resource ids.
pub mod server {
    /// Short Server ID.
    pub const SHORT_SERVER_ID: u16 = 0;
    /// Lifetime (seconds).
    pub const LIFETIME: u16 = 1;
    /// Disable (executable).
    pub const DISABLE: u16 = 4;
    /// Disable Timeout (seconds).
    pub const DISABLE_TIMEOUT: u16 = 5;
    /// Binding.
    pub const BINDING: u16 = 7;
    /// Registration Update Trigger (executable).
    pub const REGISTRATION_UPDATE_TRIGGER: u16 = 8;
}

/// Access Control object resource ids.
pub mod access_control {
    /// Target object id.
    pub const OBJECT_ID: u16 = 0;
    /// Target instance id (`65535` addresses the object itself).
    pub const INSTANCE_ID: u16 = 1;
    /// ACL, one resource instance per SSID.
    pub const ACL: u16 = 2;
    /// Owning SSID.
    pub const OWNER: u16 = 3;
}

/// Largest usable instance id; `65535` is reserved.
pub const MAX_INSTANCE_ID: u16 = 65534;

/// Resource value.
///
/// Values are kept in their plain-text encoding; binary codecs live outside
/// the core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resource {
    /// Single-instance resource.
    Single(Bytes),
    /// Multiple-instance resource, by resource instance id.
    Multiple(BTreeMap<u16, Bytes>),
}

impl Resource {
    /// Single-instance resource from text.
    pub fn text(value: impl Into<String>) -> Self {
        Self::Single(Bytes::from(value.into()))
    }

    /// UTF-8 view of a single value.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Single(bytes) => std::str::from_utf8(bytes).ok(),
            Self::Multiple(_) => None,
        }
    }

    /// Single value parsed as an integer.
    pub fn as_u64(&self) -> Option<u64> {
        self.as_text().and_then(|text| text.trim().parse().ok())
    }

    /// Single value parsed as a boolean (`1`/`0`, `true`/`false`).
    pub fn as_bool(&self) -> Option<bool> {
        match self.as_text()?.trim() {
            "1" | "true" => Some(true),
            "0" | "false" => Some(false),
            _ => None,
        }
    }
}

/// Resources of one object instance.
pub type Instance = BTreeMap<u16, Resource>;

/// One object and its instances.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectEntry {
    version: Option<String>,
    instances: BTreeMap<u16, Instance>,
}

impl ObjectEntry {
    /// Declared object version, `None` meaning the protocol default.
    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// Instances in ascending id order.
    pub fn instances(&self) -> impl Iterator<Item = (u16, &Instance)> {
        self.instances.iter().map(|(iid, instance)| (*iid, instance))
    }

    /// One instance.
    pub fn instance(&self, iid: u16) -> Option<&Instance> {
        self.instances.get(&iid)
    }

    /// True if no instance exists.
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    fn lowest_free_id(&self) -> Option<u16> {
        (0..=MAX_INSTANCE_ID).find(|iid| !self.instances.contains_key(iid))
    }
}

/// The device's data model.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectTree {
    objects: BTreeMap<u16, ObjectEntry>,
}

impl ObjectTree {
    /// Empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare an object. Re-declaring keeps existing instances and updates
    /// the version.
    pub fn register_object(&mut self, oid: u16, version: Option<&str>) {
        let entry = self.objects.entry(oid).or_default();
        entry.version = version.map(str::to_string);
    }

    /// Objects in ascending id order.
    pub fn objects(&self) -> impl Iterator<Item = (u16, &ObjectEntry)> {
        self.objects.iter().map(|(oid, entry)| (*oid, entry))
    }

    /// One object.
    pub fn object(&self, oid: u16) -> Option<&ObjectEntry> {
        self.objects.get(&oid)
    }

    /// One instance.
    pub fn instance(&self, oid: u16, iid: u16) -> Option<&Instance> {
        self.objects.get(&oid)?.instances.get(&iid)
    }

    /// Mutable instance, or `NotFound`.
    pub fn instance_mut(&mut self, oid: u16, iid: u16) -> Result<&mut Instance, RequestError> {
        self.objects
            .get_mut(&oid)
            .and_then(|object| object.instances.get_mut(&iid))
            .ok_or_else(|| RequestError::NotFound(Path::for_instance(oid, iid)))
    }

    /// One resource.
    pub fn resource(&self, oid: u16, iid: u16, rid: u16) -> Option<&Resource> {
        self.instance(oid, iid)?.get(&rid)
    }

    /// Create an instance, allocating the lowest free id when `iid` is
    /// `None`.
    pub fn create_instance(&mut self, oid: u16, iid: Option<u16>) -> Result<u16, RequestError> {
        let object = self
            .objects
            .get_mut(&oid)
            .ok_or_else(|| RequestError::NotFound(Path::for_object(oid)))?;

        let iid = match iid {
            Some(iid) if iid > MAX_INSTANCE_ID => {
                return Err(RequestError::NotFound(Path::for_instance(oid, iid)));
            },
            Some(iid) if object.instances.contains_key(&iid) => {
                return Err(RequestError::AlreadyExists(Path::for_instance(oid, iid)));
            },
            Some(iid) => iid,
            None => object.lowest_free_id().ok_or_else(|| RequestError::Inconsistent {
                reason: format!("object {oid} has no free instance id"),
            })?,
        };

        object.instances.insert(iid, Instance::new());
        Ok(iid)
    }

    /// Instance `(oid, iid)`, declaring the object and creating the instance
    /// if needed.
    pub fn ensure_instance(&mut self, oid: u16, iid: u16) -> &mut Instance {
        self.objects.entry(oid).or_default().instances.entry(iid).or_default()
    }

    /// Remove an instance.
    pub fn delete_instance(&mut self, oid: u16, iid: u16) -> Result<Instance, RequestError> {
        self.objects
            .get_mut(&oid)
            .and_then(|object| object.instances.remove(&iid))
            .ok_or_else(|| RequestError::NotFound(Path::for_instance(oid, iid)))
    }

    /// Remove every instance of `oid` for which `keep` is false.
    pub fn retain_instances(&mut self, oid: u16, mut keep: impl FnMut(u16, &Instance) -> bool) {
        if let Some(object) = self.objects.get_mut(&oid) {
            object.instances.retain(|iid, instance| keep(*iid, instance));
        }
    }

    /// Store a single-instance resource value. The instance must exist unless
    /// `create_instance` is set.
    pub fn write_resource(
        &mut self,
        path: &Path,
        value: Bytes,
        create_instance: bool,
    ) -> Result<(), RequestError> {
        let (oid, iid, rid) = resource_ids(path)?;
        let instance = self.instance_for_write(oid, iid, create_instance)?;

        match path.resource_instance_id() {
            None => {
                instance.insert(rid, Resource::Single(value));
            },
            Some(riid) => match instance.entry(rid).or_insert_with(multiple) {
                Resource::Multiple(values) => {
                    values.insert(riid, value);
                },
                Resource::Single(_) => {
                    return Err(RequestError::MethodNotAllowed);
                },
            },
        }
        Ok(())
    }

    /// Replace the resources of one instance with `resources`.
    pub fn write_instance(
        &mut self,
        oid: u16,
        iid: u16,
        resources: &[(u16, Bytes)],
        create_instance: bool,
    ) -> Result<(), RequestError> {
        let instance = self.instance_for_write(oid, iid, create_instance)?;
        for (rid, value) in resources {
            instance.insert(*rid, Resource::Single(value.clone()));
        }
        Ok(())
    }

    fn instance_for_write(
        &mut self,
        oid: u16,
        iid: u16,
        create_instance: bool,
    ) -> Result<&mut Instance, RequestError> {
        let object = self
            .objects
            .get_mut(&oid)
            .ok_or_else(|| RequestError::NotFound(Path::for_object(oid)))?;

        if create_instance {
            if iid > MAX_INSTANCE_ID {
                return Err(RequestError::NotFound(Path::for_instance(oid, iid)));
            }
            return Ok(object.instances.entry(iid).or_default());
        }

        object
            .instances
            .get_mut(&iid)
            .ok_or_else(|| RequestError::NotFound(Path::for_instance(oid, iid)))
    }
}

fn multiple() -> Resource {
    Resource::Multiple(BTreeMap::new())
}

/// Split a resource (or resource instance) path into its ids.
pub(crate) fn resource_ids(path: &Path) -> Result<(u16, u16, u16), RequestError> {
    match (path.object_id(), path.instance_id(), path.resource_id()) {
        (Some(oid), Some(iid), Some(rid)) => Ok((oid, iid, rid)),
        _ => Err(RequestError::Protocol(lwm2m_proto::ProtocolError::UnsupportedTarget {
            method: "resource access".to_string(),
            target: path.to_string(),
        })),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn tree_with(oid: u16) -> ObjectTree {
        let mut tree = ObjectTree::new();
        tree.register_object(oid, None);
        tree
    }

    #[test]
    fn iteration_is_ascending_regardless_of_creation_order() {
        let mut tree = tree_with(1);
        tree.create_instance(1, Some(42)).unwrap();
        tree.create_instance(1, Some(24)).unwrap();
        tree.register_object(0, None);

        let oids: Vec<_> = tree.objects().map(|(oid, _)| oid).collect();
        assert_eq!(oids, vec![0, 1]);

        let iids: Vec<_> = tree.object(1).unwrap().instances().map(|(iid, _)| iid).collect();
        assert_eq!(iids, vec![24, 42]);
    }

    #[test]
    fn create_allocates_lowest_free_id() {
        let mut tree = tree_with(1337);
        tree.create_instance(1337, Some(0)).unwrap();
        tree.create_instance(1337, Some(2)).unwrap();

        assert_eq!(tree.create_instance(1337, None).unwrap(), 1);
        assert_eq!(tree.create_instance(1337, None).unwrap(), 3);
    }

    #[test]
    fn create_rejects_duplicates_and_missing_objects() {
        let mut tree = tree_with(5);
        tree.create_instance(5, Some(0)).unwrap();

        assert!(matches!(tree.create_instance(5, Some(0)), Err(RequestError::AlreadyExists(_))));
        assert!(matches!(tree.create_instance(6, None), Err(RequestError::NotFound(_))));
    }

    #[test]
    fn write_resource_requires_instance_unless_creating() {
        let mut tree = tree_with(1337);
        let path = Path::parse("/1337/1/1").unwrap();

        let err = tree.write_resource(&path, Bytes::from_static(b"42"), false).unwrap_err();
        assert!(matches!(err, RequestError::NotFound(_)));

        tree.write_resource(&path, Bytes::from_static(b"42"), true).unwrap();
        assert_eq!(tree.resource(1337, 1, 1).unwrap().as_text(), Some("42"));
    }

    #[test]
    fn resource_instances_live_in_multiple_resources() {
        let mut tree = tree_with(2);
        tree.create_instance(2, Some(0)).unwrap();
        let path = Path::parse("/2/0/2/11").unwrap();
        tree.write_resource(&path, Bytes::from_static(b"15"), false).unwrap();

        match tree.resource(2, 0, 2).unwrap() {
            Resource::Multiple(values) => assert_eq!(values.get(&11).unwrap().as_ref(), b"15"),
            Resource::Single(_) => panic!("expected multiple-instance resource"),
        }
    }

    #[test]
    fn typed_views() {
        assert_eq!(Resource::text("86400").as_u64(), Some(86400));
        assert_eq!(Resource::text("1").as_bool(), Some(true));
        assert_eq!(Resource::text("false").as_bool(), Some(false));
        assert_eq!(Resource::text("x").as_bool(), None);
    }

    #[test]
    fn retain_removes_unkept_instances() {
        let mut tree = tree_with(0);
        for iid in 0..4 {
            tree.create_instance(0, Some(iid)).unwrap();
        }
        tree.retain_instances(0, |iid, _| iid % 2 == 0);
        let iids: Vec<_> = tree.object(0).unwrap().instances().map(|(iid, _)| iid).collect();
        assert_eq!(iids, vec![0, 2]);
    }
}
