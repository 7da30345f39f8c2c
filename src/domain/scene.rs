//! Scene/marker records shared by the detector and the manual marker API
//! (spec §4.4.6). The on-disk document key remains `scenes`; the external
//! API calls these "markers" — both detection-produced and user-supplied
//! entries live in the same array.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Marker {
    pub time: f64,
    #[serde(default)]
    pub scene: bool,
    #[serde(default, rename = "type")]
    pub marker_type: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub intro: bool,
    #[serde(default)]
    pub outro: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ScenesDocument {
    pub scenes: Vec<Marker>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intro: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outro: Option<f64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ScenesDocument {
    /// Sets (or replaces) the single intro/outro marker, clearing the flag
    /// from any other marker and mirroring the time onto the top-level
    /// field, per spec invariant: "Setting intro or outro must clear the
    /// flag from any other marker."
    pub fn set_exclusive_flag(&mut self, time: f64, is_intro: bool) {
        for m in &mut self.scenes {
            if is_intro {
                m.intro = false;
            } else {
                m.outro = false;
            }
        }
        let idx = self
            .scenes
            .iter()
            .position(|m| (m.time - time).abs() < f64::EPSILON);
        match idx {
            Some(i) => {
                if is_intro {
                    self.scenes[i].intro = true;
                } else {
                    self.scenes[i].outro = true;
                }
            }
            None => {
                let mut marker = Marker {
                    time,
                    scene: false,
                    marker_type: Some(if is_intro { "intro" } else { "outro" }.to_string()),
                    label: None,
                    name: None,
                    intro: is_intro,
                    outro: !is_intro,
                };
                if is_intro {
                    marker.outro = false;
                } else {
                    marker.intro = false;
                }
                self.scenes.push(marker);
            }
        }
        if is_intro {
            self.intro = Some(time);
        } else {
            self.outro = Some(time);
        }
    }

    pub fn dedupe_close_timestamps(&mut self, min_gap_secs: f64) {
        self.scenes.sort_by(|a, b| a.time.partial_cmp(&b.time).unwrap());
        let mut out: Vec<Marker> = Vec::with_capacity(self.scenes.len());
        for m in self.scenes.drain(..) {
            if let Some(last) = out.last() {
                if (m.time - last.time).abs() < min_gap_secs {
                    continue;
                }
            }
            out.push(m);
        }
        self.scenes = out;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_intro_is_idempotent() {
        let mut doc = ScenesDocument::default();
        doc.set_exclusive_flag(1.5, true);
        doc.set_exclusive_flag(1.5, true);
        assert_eq!(doc.scenes.iter().filter(|m| m.intro).count(), 1);
        assert_eq!(doc.intro, Some(1.5));
    }

    #[test]
    fn setting_intro_clears_other_markers_intro_flag() {
        let mut doc = ScenesDocument::default();
        doc.set_exclusive_flag(1.0, true);
        doc.set_exclusive_flag(5.0, true);
        assert_eq!(doc.scenes.iter().filter(|m| m.intro).count(), 1);
        assert!(doc.scenes.iter().find(|m| m.time == 5.0).unwrap().intro);
    }

    #[test]
    fn dedupe_drops_close_timestamps() {
        let mut doc = ScenesDocument::default();
        doc.scenes = vec![
            Marker { time: 10.0, scene: true, marker_type: None, label: None, name: Some("1".into()), intro: false, outro: false },
            Marker { time: 10.1, scene: true, marker_type: None, label: None, name: Some("2".into()), intro: false, outro: false },
            Marker { time: 20.0, scene: true, marker_type: None, label: None, name: Some("3".into()), intro: false, outro: false },
        ];
        doc.dedupe_close_timestamps(0.25);
        assert_eq!(doc.scenes.len(), 2);
    }
}
