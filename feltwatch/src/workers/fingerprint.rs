// feltwatch/src/workers/fingerprint.rs
//
// Device fingerprinting.
//
// The client reports a bag of device attributes at login. We hash a
// canonical form of that bag so the same device always maps to the same
// fingerprint:
//   - list-valued attributes (fonts, plugins) are sorted and deduplicated,
//     since browsers enumerate them in unstable order
//   - the canonical value is serialized as JSON (field order is fixed by
//     the struct), then SHA-256'd and hex-encoded

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceAttributes {
    pub user_agent: String,
    pub platform: String,
    pub screen_resolution: String,
    pub color_depth: u8,
    pub timezone: String,
    pub language: String,
    pub gpu_renderer: String,
    pub cpu_cores: u16,
    pub device_memory_gb: u16,
    pub touch_support: bool,
    pub canvas_hash: String,
    pub audio_hash: String,
    pub fonts: Vec<String>,
    pub plugins: Vec<String>,
}

impl DeviceAttributes {
    fn canonical(&self) -> Self {
        let mut c = self.clone();
        c.fonts.sort();
        c.fonts.dedup();
        c.plugins.sort();
        c.plugins.dedup();
        c
    }

    /// Stable hex SHA-256 over the canonical attribute set.
    pub fn fingerprint(&self) -> String {
        // Serializing plain strings/ints/bools to a Vec cannot fail.
        let body = serde_json::to_vec(&self.canonical()).unwrap_or_default();
        let mut h = Sha256::new();
        h.update(b"feltwatch-device-v1\0");
        h.update(&body);
        hex::encode(h.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs() -> DeviceAttributes {
        DeviceAttributes {
            user_agent: "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0)".into(),
            platform: "iOS".into(),
            screen_resolution: "1179x2556".into(),
            color_depth: 24,
            timezone: "Asia/Manila".into(),
            language: "en-PH".into(),
            gpu_renderer: "Apple GPU".into(),
            cpu_cores: 6,
            device_memory_gb: 6,
            touch_support: true,
            canvas_hash: "c0ffee".into(),
            audio_hash: "a11d10".into(),
            fonts: vec!["Helvetica".into(), "Arial".into()],
            plugins: vec![],
        }
    }

    #[test]
    fn identical_attributes_hash_identically() {
        assert_eq!(attrs().fingerprint(), attrs().fingerprint());
        assert_eq!(attrs().fingerprint().len(), 64);
    }

    #[test]
    fn font_order_and_duplicates_do_not_matter() {
        let mut shuffled = attrs();
        shuffled.fonts = vec!["Arial".into(), "Helvetica".into(), "Arial".into()];
        assert_eq!(attrs().fingerprint(), shuffled.fingerprint());
    }

    #[test]
    fn any_single_change_changes_the_hash() {
        let base = attrs().fingerprint();
        let mutations: Vec<Box<dyn Fn(&mut DeviceAttributes)>> = vec![
            Box::new(|a| a.timezone = "UTC".into()),
            Box::new(|a| a.gpu_renderer.push('!')),
            Box::new(|a| a.cpu_cores += 1),
            Box::new(|a| a.touch_support = false),
            Box::new(|a| a.fonts.push("Courier".into())),
            Box::new(|a| a.screen_resolution = "1080x1920".into()),
        ];
        for m in mutations {
            let mut a = attrs();
            m(&mut a);
            assert_ne!(a.fingerprint(), base);
        }
    }
}
