//! Concrete services, one per cloud resource kind.

pub mod agentpools;
pub mod document;
pub mod images;
pub mod managedclusters;
pub mod privateendpoints;
pub mod securitygroups;

pub use images::{
    resolve_image_references, ImageCache, ImageError, ImageKey, ImageLister, ImageResolver,
};
pub use managedclusters::ManagedClusterService;
