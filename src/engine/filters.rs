//! Typed filter-graph construction
//!
//! Every interpolation stage renders exactly one labeled linear graph.
//! Labels follow the fixed ladder `in → decim → middle → interp → out`;
//! building the string in one place keeps the argv free of ad-hoc
//! concatenation.

use crate::error::StageKind;
use crate::registry::StageParams;

/// Intermediate labels between the input and `out`
const LABELS: [&str; 3] = ["decim", "middle", "interp"];

/// A linear filter chain with the fixed label ladder
#[derive(Debug, Clone, Default)]
pub struct FilterGraph {
    filters: Vec<String>,
}

impl FilterGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(mut self, filter: impl Into<String>) -> Self {
        self.filters.push(filter.into());
        self
    }

    /// Render for `-filter_complex`, wiring `input` into the first node
    ///
    /// Panics if more filters were pushed than the label ladder covers;
    /// stages never build more than four nodes.
    pub fn render(&self, input: &str) -> String {
        assert!(
            !self.filters.is_empty() && self.filters.len() <= LABELS.len() + 1,
            "filter graph must hold 1..=4 nodes"
        );

        let mut rendered = Vec::with_capacity(self.filters.len());
        let mut in_label = format!("[{}]", input);
        for (i, filter) in self.filters.iter().enumerate() {
            let out_label = if i + 1 == self.filters.len() {
                "[out]".to_string()
            } else {
                format!("[{}]", LABELS[i])
            };
            rendered.push(format!("{}{}{}", in_label, filter, out_label));
            in_label = out_label;
        }
        rendered.join(";")
    }
}

/// Even dimensions and full-range scaling, the common chain prefix
fn range_prefix() -> String {
    "scale=trunc(iw/2)*2:trunc(ih/2)*2:in_range=full:out_range=full".to_string()
}

/// Full-chroma accurate-rounding output scale, the common chain suffix
fn range_suffix() -> String {
    "scale=in_range=full:out_range=full:flags=full_chroma_int+accurate_rnd".to_string()
}

/// Duplicate-frame decimation, parameterised per stage
fn decimate(max: u32, frac: f64) -> String {
    format!("mpdecimate=max={}:frac={}", max, frac)
}

/// High-quality frame mixer raising (or lowering) to `fps`
fn mixer(fps: u32) -> String {
    format!("libplacebo=fps={}:frame_mixer=mitchell_clamp", fps)
}

/// Plain rate conversion without mixing
fn no_mixer(fps: u32) -> String {
    format!("libplacebo=fps={}:frame_mixer=none", fps)
}

/// Alt-algorithm up-pass: classic motion compensation, duplication mode
fn alt_up(fps: u32) -> String {
    format!("minterpolate=fps={}:mi_mode=dup", fps)
}

/// Alt-algorithm down-pass: motion-compensated interpolation with
/// overlapped blocks, bidirectional estimation and variable block sizes
fn alt_down(fps: u32) -> String {
    format!(
        "minterpolate=fps={}:mi_mode=mci:mc_mode=aobmc:me_mode=bidir:vsbmc=1",
        fps
    )
}

/// Render the interpolation graph for a worker's parameters
///
/// The up-pass mixes only when the source rate exceeds the intermediate
/// maximum; `source_exceeds_max` carries that planner decision. The alt
/// flag swaps the libplacebo family for the minterpolate one after a
/// freeze.
pub fn interp_graph(params: &StageParams, source_exceeds_max: bool) -> FilterGraph {
    let graph = FilterGraph::new()
        .push(range_prefix())
        .push(decimate(params.decimate_max, params.decimate_frac));

    let interp = match (params.stage, params.alt_algorithm) {
        (StageKind::InterpUp, false) => {
            if source_exceeds_max {
                mixer(params.target_fps)
            } else {
                no_mixer(params.target_fps)
            }
        }
        (StageKind::InterpUp, true) => alt_up(params.target_fps),
        (_, false) => mixer(params.target_fps),
        (_, true) => alt_down(params.target_fps),
    };

    graph.push(interp).push(range_suffix())
}

/// Render the assemble graph enforcing CFR output
///
/// The mixer is used only when drop/dup frames were observed during the
/// interpolation stages; a clean run gets the cheap no-mixer variant.
pub fn assemble_graph(target_fps: u32, dropdups_seen: bool) -> FilterGraph {
    let interp = if dropdups_seen {
        mixer(target_fps)
    } else {
        no_mixer(target_fps)
    };

    FilterGraph::new()
        .push(range_prefix())
        .push(interp)
        .push(format!("fps={}:round=near", target_fps))
        .push(range_suffix())
}
