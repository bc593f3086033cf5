//! Access Control Gate.
//!
//! Maps (object, instance) x Short Server ID to a set of permitted
//! operations. Entries mirror the instances of the Access Control object
//! (oid 2) in the tree; the gate is rebuilt from the tree whenever that
//! object changes, so there is exactly one source of truth.
//!
//! # Decision order
//!
//! For server `s` acting on `(oid, iid)`:
//!
//! 1. The Security object is never accessible.
//! 2. With exactly one server provisioned, everything else is.
//! 3. If an entry targets `(oid, iid)`: the owner gets [`AccessMask::OWNER`],
//!    other servers get their ACL mask, falling back to the SSID 0 default.
//! 4. Otherwise nothing is permitted.
//!
//! Create checks the object-level entry (`iid` absent).

use std::{collections::BTreeMap, fmt, str::FromStr};

use bitflags::bitflags;
use bytes::Bytes;
use lwm2m_proto::Method;
use serde::{Deserialize, Serialize};

use crate::{
    dm::{Instance, ObjectTree, Resource, access_control, oid},
    registry::Ssid,
};

/// Instance id stored in the tree for object-level entries.
pub const OBJECT_LEVEL_IID: u16 = 65535;

/// SSID whose ACL mask applies to servers without their own.
pub const DEFAULT_ACL_SSID: Ssid = Ssid(0);

bitflags! {
    /// Permitted operations.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct AccessMask: u16 {
        /// Read, Observe, Discover.
        const READ = 1;
        /// Write.
        const WRITE = 1 << 1;
        /// Execute.
        const EXECUTE = 1 << 2;
        /// Delete.
        const DELETE = 1 << 3;
        /// Create (object-level entries only).
        const CREATE = 1 << 4;
        /// Granted to the owner of an entry.
        const OWNER = Self::READ.bits()
            | Self::WRITE.bits()
            | Self::EXECUTE.bits()
            | Self::DELETE.bits();
    }
}

impl AccessMask {
    /// Right a method needs.
    pub fn required_for(method: Method) -> Self {
        match method {
            Method::Read | Method::Observe | Method::Discover => Self::READ,
            Method::Write => Self::WRITE,
            Method::Execute => Self::EXECUTE,
            Method::Delete => Self::DELETE,
            Method::Create => Self::CREATE,
            Method::BootstrapFinish => Self::all(),
        }
    }
}

/// What an entry governs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AccessTarget {
    /// Target object.
    pub oid: u16,
    /// Target instance, `None` for the object itself.
    pub iid: Option<u16>,
}

impl fmt::Display for AccessTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.iid {
            Some(iid) => write!(f, "/{}/{iid}", self.oid),
            None => write!(f, "/{}", self.oid),
        }
    }
}

/// One Access Control object instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessEntry {
    /// Governed object or instance.
    pub target: AccessTarget,
    /// Owning server; gets [`AccessMask::OWNER`].
    pub owner: Ssid,
    /// Per-server grants.
    pub acl: BTreeMap<Ssid, AccessMask>,
}

impl AccessEntry {
    /// Entry owned by `owner` with no further grants.
    pub fn owned(target: AccessTarget, owner: Ssid) -> Self {
        Self { target, owner, acl: BTreeMap::new() }
    }

    /// Add a grant.
    #[must_use]
    pub fn grant(mut self, ssid: Ssid, mask: AccessMask) -> Self {
        self.acl.insert(ssid, mask);
        self
    }

    /// Mask for `ssid` under this entry.
    pub fn mask_for(&self, ssid: Ssid) -> AccessMask {
        if self.owner == ssid {
            return self.acl.get(&ssid).map_or(AccessMask::OWNER, |mask| AccessMask::OWNER | *mask);
        }
        self.acl
            .get(&ssid)
            .or_else(|| self.acl.get(&DEFAULT_ACL_SSID))
            .copied()
            .unwrap_or(AccessMask::empty())
    }

    /// Read an entry back from an Access Control instance.
    pub fn from_instance(instance: &Instance) -> Option<Self> {
        let number = |rid| instance.get(&rid).and_then(Resource::as_u64);
        let oid = u16::try_from(number(access_control::OBJECT_ID)?).ok()?;
        let iid = u16::try_from(number(access_control::INSTANCE_ID)?).ok()?;
        let owner = number(access_control::OWNER)
            .and_then(|value| u16::try_from(value).ok())
            .map_or(Ssid::BOOTSTRAP, Ssid);

        let mut acl = BTreeMap::new();
        if let Some(Resource::Multiple(grants)) = instance.get(&access_control::ACL) {
            for (ssid, mask) in grants {
                let bits = std::str::from_utf8(mask).ok().and_then(|text| text.parse().ok());
                if let Some(bits) = bits {
                    acl.insert(Ssid(*ssid), AccessMask::from_bits_truncate(bits));
                }
            }
        }

        let iid = (iid != OBJECT_LEVEL_IID).then_some(iid);
        Some(Self { target: AccessTarget { oid, iid }, owner, acl })
    }

    /// Resources of the Access Control instance representing this entry.
    pub fn to_instance(&self) -> Instance {
        let text = |value: u16| Resource::Single(Bytes::from(value.to_string()));
        let grants = self
            .acl
            .iter()
            .map(|(ssid, mask)| (ssid.0, Bytes::from(mask.bits().to_string())))
            .collect();

        let mut instance = Instance::new();
        instance.insert(access_control::OBJECT_ID, text(self.target.oid));
        instance.insert(
            access_control::INSTANCE_ID,
            text(self.target.iid.unwrap_or(OBJECT_LEVEL_IID)),
        );
        instance.insert(access_control::ACL, Resource::Multiple(grants));
        instance.insert(access_control::OWNER, text(self.owner.0));
        instance
    }
}

/// Error parsing an `/OID[/IID],SSID,MASK` access entry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid access entry {text:?}: expected /OID[/IID],SSID,MASK")]
pub struct AccessEntryParseError {
    /// The offending text.
    pub text: String,
}

impl FromStr for AccessEntry {
    type Err = AccessEntryParseError;

    /// Parse the command-line form `/OID[/IID],SSID,MASK`, which grants
    /// `MASK` to `SSID`. The resulting entry is owned by the bootstrap
    /// server.
    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let err = || AccessEntryParseError { text: text.to_string() };

        let mut fields = text.split(',');
        let (Some(path), Some(ssid), Some(mask), None) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            return Err(err());
        };

        let path = lwm2m_proto::Path::parse(path.trim()).map_err(|_| err())?;
        let target = match (path.object_id(), path.instance_id(), path.resource_id()) {
            (Some(oid), iid, None) => AccessTarget { oid, iid },
            _ => return Err(err()),
        };
        let ssid = ssid.trim().parse().map(Ssid).map_err(|_| err())?;
        let mask = mask.trim().parse().map(AccessMask::from_bits_truncate).map_err(|_| err())?;

        Ok(Self::owned(target, Ssid::BOOTSTRAP).grant(ssid, mask))
    }
}

/// The gate itself.
#[derive(Debug, Clone, Default)]
pub struct AccessControl {
    entries: BTreeMap<AccessTarget, AccessEntry>,
}

impl AccessControl {
    /// Index the Access Control object of `tree`.
    pub fn from_tree(tree: &ObjectTree) -> Self {
        let mut entries = BTreeMap::new();
        if let Some(object) = tree.object(oid::ACCESS_CONTROL) {
            for (iid, instance) in object.instances() {
                match AccessEntry::from_instance(instance) {
                    Some(entry) => {
                        entries.insert(entry.target, entry);
                    },
                    None => tracing::trace!(iid, "skipping malformed access control instance"),
                }
            }
        }
        Self { entries }
    }

    /// Entry for `target`.
    pub fn entry(&self, target: AccessTarget) -> Option<&AccessEntry> {
        self.entries.get(&target)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if there are no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Rights of `ssid` on `target`.
    pub fn mask_for(&self, ssid: Ssid, target: AccessTarget, single_server: bool) -> AccessMask {
        if target.oid == oid::SECURITY {
            return AccessMask::empty();
        }
        if single_server {
            return AccessMask::all();
        }
        self.entries.get(&target).map_or(AccessMask::empty(), |entry| entry.mask_for(ssid))
    }

    /// True if `ssid` may perform `method` on `target`.
    pub fn permits(
        &self,
        ssid: Ssid,
        method: Method,
        target: AccessTarget,
        single_server: bool,
    ) -> bool {
        let target =
            if method == Method::Create { AccessTarget { iid: None, ..target } } else { target };
        self.mask_for(ssid, target, single_server).contains(AccessMask::required_for(method))
    }

    /// True if `ssid` may learn that `(oid, iid)` exists.
    ///
    /// An object is visible when any of its instances is, or when its
    /// object-level entry grants anything.
    pub fn is_visible(
        &self,
        tree: &ObjectTree,
        ssid: Ssid,
        oid: u16,
        iid: Option<u16>,
        single_server: bool,
    ) -> bool {
        let check = |iid| !self.mask_for(ssid, AccessTarget { oid, iid }, single_server).is_empty();
        match iid {
            Some(_) => check(iid),
            None => {
                check(None)
                    || tree
                        .object(oid)
                        .is_some_and(|object| object.instances().any(|(iid, _)| check(Some(iid))))
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn instance_target(oid: u16, iid: u16) -> AccessTarget {
        AccessTarget { oid, iid: Some(iid) }
    }

    fn gate(entries: &[AccessEntry]) -> (ObjectTree, AccessControl) {
        let mut tree = ObjectTree::new();
        tree.register_object(oid::ACCESS_CONTROL, None);
        for entry in entries {
            let iid = tree.create_instance(oid::ACCESS_CONTROL, None).unwrap();
            *tree.instance_mut(oid::ACCESS_CONTROL, iid).unwrap() = entry.to_instance();
        }
        let gate = AccessControl::from_tree(&tree);
        (tree, gate)
    }

    #[test]
    fn owner_mask_excludes_create() {
        assert!(!AccessMask::OWNER.contains(AccessMask::CREATE));
        assert_eq!(AccessMask::OWNER.bits(), 15);
    }

    #[test]
    fn parses_command_line_entries() {
        let entry: AccessEntry = "/1/1,2,15".parse().unwrap();
        assert_eq!(entry.target, instance_target(1, 1));
        assert_eq!(entry.owner, Ssid::BOOTSTRAP);
        assert_eq!(entry.mask_for(Ssid(2)), AccessMask::OWNER);

        let object_level: AccessEntry = "/1337,3,16".parse().unwrap();
        assert_eq!(object_level.target, AccessTarget { oid: 1337, iid: None });

        for bad in ["/1/1", "1/1,2,15", "/1/1/1,2,15", "/1,x,15", "/1,2,15,9"] {
            assert!(bad.parse::<AccessEntry>().is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn tree_representation_survives_rebuild() {
        let entry = AccessEntry::owned(instance_target(1, 0), Ssid(1))
            .grant(Ssid(2), AccessMask::READ | AccessMask::EXECUTE);
        let (_, gate) = gate(std::slice::from_ref(&entry));
        assert_eq!(gate.entry(entry.target), Some(&entry));
    }

    #[test]
    fn decision_order() {
        let entries = [
            AccessEntry::owned(instance_target(1, 1), Ssid(1)).grant(Ssid(2), AccessMask::OWNER),
            AccessEntry::owned(instance_target(1337, 0), Ssid(1))
                .grant(DEFAULT_ACL_SSID, AccessMask::READ),
        ];
        let (_, gate) = gate(&entries);

        assert_eq!(gate.mask_for(Ssid(1), instance_target(0, 1), true), AccessMask::empty());
        assert_eq!(gate.mask_for(Ssid(9), instance_target(42, 0), true), AccessMask::all());

        assert_eq!(gate.mask_for(Ssid(1), instance_target(1, 1), false), AccessMask::OWNER);
        assert_eq!(gate.mask_for(Ssid(2), instance_target(1, 1), false), AccessMask::OWNER);
        assert_eq!(gate.mask_for(Ssid(3), instance_target(1, 1), false), AccessMask::empty());
        assert_eq!(gate.mask_for(Ssid(3), instance_target(1337, 0), false), AccessMask::READ);
        assert_eq!(gate.mask_for(Ssid(2), instance_target(1, 2), false), AccessMask::empty());
    }

    #[test]
    fn create_checks_object_level_entry() {
        let entries = [AccessEntry::owned(AccessTarget { oid: 1337, iid: None }, Ssid::BOOTSTRAP)
            .grant(Ssid(2), AccessMask::CREATE)];
        let (_, gate) = gate(&entries);

        assert!(gate.permits(Ssid(2), Method::Create, instance_target(1337, 5), false));
        assert!(!gate.permits(Ssid(3), Method::Create, instance_target(1337, 5), false));
    }

    #[test]
    fn visibility_follows_instances() {
        let entries = [AccessEntry::owned(instance_target(1, 2), Ssid(2))];
        let (mut tree, gate) = gate(&entries);
        tree.register_object(1, None);
        tree.create_instance(1, Some(1)).unwrap();
        tree.create_instance(1, Some(2)).unwrap();

        assert!(gate.is_visible(&tree, Ssid(2), 1, None, false));
        assert!(gate.is_visible(&tree, Ssid(2), 1, Some(2), false));
        assert!(!gate.is_visible(&tree, Ssid(2), 1, Some(1), false));
        assert!(!gate.is_visible(&tree, Ssid(1), 1, None, false));
    }
}
