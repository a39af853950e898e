use super::surface::{Layer, Surface};
use log::debug;
use std::sync::Arc;

/// Which layers the external process asks for.
///
/// Codes match the values sent in `mode=<n>` fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputMode {
    NoInput,
    ActiveLayer,
    AllLayers,
    ActiveAndBelow,
    ActiveAndAbove,
    AllVisibleLayers,
    AllHiddenLayers,
    /// Deprecated. Accepted on decode, answered in top-to-bottom order.
    AllVisibleLayersDescending,
    /// Deprecated. Accepted on decode, answered in top-to-bottom order.
    AllHiddenLayersDescending,
}

impl InputMode {
    /// Decode a wire value. Unknown values fall back to `ActiveLayer`.
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => Self::NoInput,
            1 => Self::ActiveLayer,
            2 => Self::AllLayers,
            3 => Self::ActiveAndBelow,
            4 => Self::ActiveAndAbove,
            5 => Self::AllVisibleLayers,
            6 => Self::AllHiddenLayers,
            7 => Self::AllVisibleLayersDescending,
            8 => Self::AllHiddenLayersDescending,
            other => {
                debug!("[LAYERS] Unknown input mode {}, using ActiveLayer", other);
                Self::ActiveLayer
            }
        }
    }

    /// Wire value. Deprecated variants encode as their canonical replacement.
    pub fn code(self) -> i32 {
        match self {
            Self::NoInput => 0,
            Self::ActiveLayer => 1,
            Self::AllLayers => 2,
            Self::ActiveAndBelow => 3,
            Self::ActiveAndAbove => 4,
            Self::AllVisibleLayers | Self::AllVisibleLayersDescending => 5,
            Self::AllHiddenLayers | Self::AllHiddenLayersDescending => 6,
        }
    }

    pub fn is_deprecated(self) -> bool {
        matches!(
            self,
            Self::AllVisibleLayersDescending | Self::AllHiddenLayersDescending
        )
    }
}

/// Editor-side view of one layer, read when the session snapshots the stack.
pub trait LayerSource {
    fn is_visible(&self) -> bool;
    fn surface(&self) -> Arc<Surface>;
}

/// The ordered layers of one session. Index 0 is the topmost layer.
#[derive(Debug, Default)]
pub struct LayerCollection {
    layers: Vec<Layer>,
    active_index: usize,
}

impl LayerCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot an editor stack stored bottom-to-top.
    ///
    /// `active_from_bottom` is the editor's index of its selected layer.
    pub fn snapshot<S: LayerSource>(sources: &[S], active_from_bottom: usize) -> Self {
        let layers: Vec<Layer> = sources
            .iter()
            .rev()
            .map(|source| Layer::shared(source.surface(), source.is_visible()))
            .collect();
        let active_index = layers
            .len()
            .saturating_sub(1)
            .saturating_sub(active_from_bottom);

        Self {
            layers,
            active_index,
        }
    }

    pub fn push(&mut self, layer: Layer) {
        self.layers.push(layer);
    }

    pub fn extend(&mut self, layers: impl IntoIterator<Item = Layer>) {
        self.layers.extend(layers);
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Layer> {
        self.layers.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Layer> {
        self.layers.iter()
    }

    pub fn active_index(&self) -> usize {
        self.active_index
    }

    pub fn set_active_index(&mut self, index: usize) {
        self.active_index = index;
    }

    pub fn active(&self) -> Option<&Layer> {
        self.layers.get(self.active_index)
    }

    /// Layers for `mode`, in top-to-bottom order.
    pub fn select(&self, mode: InputMode) -> Vec<&Layer> {
        let active = self.active_index;
        let in_range = active < self.layers.len();

        match mode {
            InputMode::NoInput => Vec::new(),
            InputMode::ActiveLayer => self.active().into_iter().collect(),
            InputMode::ActiveAndAbove if in_range => {
                let end = (active + 2).min(self.layers.len());
                self.layers[active..end].iter().collect()
            }
            InputMode::ActiveAndBelow if in_range => {
                let start = active.saturating_sub(1);
                self.layers[start..=active].iter().collect()
            }
            InputMode::ActiveAndAbove | InputMode::ActiveAndBelow => Vec::new(),
            InputMode::AllLayers => self.layers.iter().collect(),
            InputMode::AllVisibleLayers | InputMode::AllVisibleLayersDescending => {
                self.layers.iter().filter(|l| l.is_visible()).collect()
            }
            InputMode::AllHiddenLayers | InputMode::AllHiddenLayersDescending => {
                self.layers.iter().filter(|l| !l.is_visible()).collect()
            }
        }
    }

    /// Bounding size of the layers selected by `mode`. `(0, 0)` when nothing is selected.
    pub fn max_size(&self, mode: InputMode) -> (u32, u32) {
        self.select(mode)
            .iter()
            .fold((0, 0), |(w, h), layer| (w.max(layer.width()), h.max(layer.height())))
    }

    /// Put `layer` in the active slot and hand back the layer it replaced.
    ///
    /// Returns `None` and drops `layer` when there is no active slot.
    pub fn replace_active(&mut self, layer: Layer) -> Option<Layer> {
        let slot = self.layers.get_mut(self.active_index)?;
        Some(std::mem::replace(slot, layer))
    }

    /// Release every layer. Returns how many were released.
    pub fn clear(&mut self) -> usize {
        let count = self.layers.len();
        self.layers.clear();
        self.active_index = 0;
        count
    }
}
