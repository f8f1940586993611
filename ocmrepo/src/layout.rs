//! The manifest shape shared by both backends: a component version is an
//! OCI index whose first image manifest carries the serialized descriptor as
//! a layer (plus one layer per local blob), with the component config blob
//! pointing at the descriptor layer.

use std::collections::HashMap;

use bytes::Bytes;
use oci_spec::image::{
    Descriptor, DescriptorBuilder, Digest as OciDigest, ImageIndex, ImageIndexBuilder,
    ImageManifest, ImageManifestBuilder, MediaType,
};

use ocmmodel::descriptor::ComponentDescriptor;

use crate::repository::Error;
use crate::{MT_COMPONENT_CONFIG, MT_COMPONENT_DESCRIPTOR};

pub const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";

/// A local blob that becomes a layer on the component manifest.
#[derive(Debug, Clone)]
pub struct LayerRef {
    pub digest: OciDigest,
    pub size: u64,
    pub media_type: String,
}

/// Content-addressed blob produced while building a component version.
pub struct BuiltBlob {
    pub digest: OciDigest,
    pub media_type: String,
    pub data: Bytes,
}

pub struct BuiltComponent {
    /// descriptor blob and config blob, to be stored content-addressed
    pub blobs: Vec<BuiltBlob>,
    /// the component image manifest (serialized) and its digest
    pub manifest_digest: OciDigest,
    pub manifest_data: Bytes,
    /// the index holding the manifest, tagged with the component version
    pub index_data: Bytes,
}

pub fn oci_digest(data: &[u8]) -> OciDigest {
    crate::ocidist::digest_from_data(data)
}

pub fn ref_name(component: &str, version: &str) -> String {
    format!("{}/{}:{}", crate::DESCRIPTOR_PATH_PREFIX, component, version)
}

/// Assemble descriptor blob, config blob, manifest and index for a component
/// version. `layers` are the local blobs already persisted by the backend;
/// `linked` are image manifests of resources with OCI access that should be
/// listed in the index next to the component manifest.
pub fn build(
    descriptor: &ComponentDescriptor,
    layers: &[LayerRef],
    linked: &[Descriptor],
) -> Result<BuiltComponent, Error> {
    let descriptor_json = serde_json::to_vec(descriptor)?;
    let descriptor_digest = oci_digest(&descriptor_json);
    let descriptor_layer = DescriptorBuilder::default()
        .media_type(MediaType::Other(MT_COMPONENT_DESCRIPTOR.to_string()))
        .digest(descriptor_digest.clone())
        .size(descriptor_json.len() as u64)
        .build()?;

    let config_json = serde_json::to_vec(&serde_json::json!({
        "componentDescriptorLayer": {
            "mediaType": MT_COMPONENT_DESCRIPTOR,
            "digest": descriptor_digest.to_string(),
            "size": descriptor_json.len(),
        }
    }))?;
    let config_digest = oci_digest(&config_json);
    let config_descriptor = DescriptorBuilder::default()
        .media_type(MediaType::Other(MT_COMPONENT_CONFIG.to_string()))
        .digest(config_digest.clone())
        .size(config_json.len() as u64)
        .build()?;

    let mut manifest_layers = vec![descriptor_layer];
    for layer in layers {
        manifest_layers.push(
            DescriptorBuilder::default()
                .media_type(MediaType::Other(layer.media_type.clone()))
                .digest(layer.digest.clone())
                .size(layer.size)
                .build()?,
        );
    }

    let manifest = ImageManifestBuilder::default()
        .schema_version(2u32)
        .media_type(MediaType::ImageManifest)
        .config(config_descriptor)
        .layers(manifest_layers)
        .build()?;
    let manifest_data = serde_json::to_vec(&manifest)?;
    let manifest_digest = oci_digest(&manifest_data);

    let annotations = HashMap::from([(
        REF_NAME_ANNOTATION.to_string(),
        ref_name(descriptor.name(), descriptor.version()),
    )]);
    let manifest_descriptor = DescriptorBuilder::default()
        .media_type(MediaType::ImageManifest)
        .digest(manifest_digest.clone())
        .size(manifest_data.len() as u64)
        .annotations(annotations)
        .build()?;

    let mut index_manifests = vec![manifest_descriptor];
    index_manifests.extend(linked.iter().cloned());

    let index = ImageIndexBuilder::default()
        .schema_version(2u32)
        .media_type(MediaType::ImageIndex)
        .manifests(index_manifests)
        .build()?;
    let index_data = serde_json::to_vec(&index)?;

    Ok(BuiltComponent {
        blobs: vec![
            BuiltBlob {
                digest: descriptor_digest,
                media_type: MT_COMPONENT_DESCRIPTOR.to_string(),
                data: descriptor_json.into(),
            },
            BuiltBlob {
                digest: config_digest,
                media_type: MT_COMPONENT_CONFIG.to_string(),
                data: config_json.into(),
            },
        ],
        manifest_digest,
        manifest_data: manifest_data.into(),
        index_data: index_data.into(),
    })
}

/// The component manifest inside an index: the first image manifest entry.
pub fn find_component_manifest(index: &ImageIndex) -> Result<&Descriptor, Error> {
    index
        .manifests()
        .iter()
        .find(|d| {
            matches!(d.media_type(), MediaType::ImageManifest)
                || d.media_type().to_string() == crate::ocidist::OCI_IMAGE_MANIFEST_V1
        })
        .ok_or_else(|| Error::CorruptLayout("index without image manifest".to_string()))
}

/// The descriptor layer of a component manifest.
pub fn find_descriptor_layer(manifest: &ImageManifest) -> Result<&Descriptor, Error> {
    manifest
        .layers()
        .iter()
        .find(|l| l.media_type().to_string() == MT_COMPONENT_DESCRIPTOR)
        .ok_or_else(|| Error::CorruptLayout("manifest without descriptor layer".to_string()))
}

pub fn parse_descriptor(data: &[u8]) -> Result<ComponentDescriptor, Error> {
    Ok(serde_json::from_slice(data)?)
}

/// Size and media type of the layer with the given digest, for rebuilding a
/// blob from a stored manifest.
pub fn layer_info(manifest: &ImageManifest, digest: &str) -> Option<(u64, String)> {
    manifest
        .layers()
        .iter()
        .find(|l| l.digest().to_string() == digest)
        .map(|l| (l.size(), l.media_type().to_string()))
}
