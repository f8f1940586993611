use std::collections::HashMap;
use std::sync::RwLock;

use oci_spec::image::Descriptor;

/// Remembers which manifest descriptors a reference (repository + tag)
/// resolved to. Many readers, one writer; the critical sections are plain
/// map operations so the lock is never held across I/O.
#[derive(Default)]
pub struct DescriptorCache {
    entries: RwLock<HashMap<String, Vec<Descriptor>>>,
}

impl DescriptorCache {
    pub fn new() -> DescriptorCache {
        DescriptorCache::default()
    }

    pub fn put(&self, reference: impl Into<String>, descriptors: Vec<Descriptor>) {
        self.entries
            .write()
            .unwrap()
            .insert(reference.into(), descriptors);
    }

    pub fn add(&self, reference: &str, descriptor: Descriptor) {
        let mut entries = self.entries.write().unwrap();
        let list = entries.entry(reference.to_string()).or_default();
        if !list
            .iter()
            .any(|d| d.digest() == descriptor.digest() && d.media_type() == descriptor.media_type())
        {
            list.push(descriptor);
        }
    }

    pub fn get(&self, reference: &str) -> Option<Vec<Descriptor>> {
        self.entries.read().unwrap().get(reference).cloned()
    }

    pub fn invalidate(&self, reference: &str) {
        self.entries.write().unwrap().remove(reference);
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oci_spec::image::MediaType;

    fn descriptor(hex_byte: u8) -> Descriptor {
        let digest: oci_spec::image::Digest =
            format!("sha256:{}", format!("{:02x}", hex_byte).repeat(32))
                .parse()
                .unwrap();
        Descriptor::new(MediaType::ImageManifest, 42, digest)
    }

    #[test]
    fn test_put_get_invalidate() {
        let cache = DescriptorCache::new();
        cache.put("example.com/r:v1", vec![descriptor(0xaa)]);
        assert_eq!(cache.get("example.com/r:v1").unwrap().len(), 1);
        cache.invalidate("example.com/r:v1");
        assert!(cache.get("example.com/r:v1").is_none());
    }

    #[test]
    fn test_add_dedups() {
        let cache = DescriptorCache::new();
        cache.add("r:v1", descriptor(0xaa));
        cache.add("r:v1", descriptor(0xaa));
        cache.add("r:v1", descriptor(0xbb));
        assert_eq!(cache.get("r:v1").unwrap().len(), 2);
    }
}
