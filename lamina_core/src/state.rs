// Copyright 2026 the Lamina Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! State groups and their values.
//!
//! Every piece of pipeline and layer configuration belongs to exactly one
//! *state group*. Groups are closed and known at compile time; each has a
//! unique bit in [`PipelineState`] or [`LayerState`], and those bit sets are
//! what the difference engine reports between two nodes.
//!
//! A node stores values only for the groups it overrides. Values are carried
//! as [`PipelineValue`] and [`LayerValue`], each of which knows its own group
//! bit. The root of each tree overrides every group with the defaults from
//! [`PipelineValue::defaults`] and [`LayerValue::defaults`].
//!
//! | Pipeline group        | Default                                |
//! |-----------------------|----------------------------------------|
//! | `COLOR`               | opaque white                           |
//! | `BLEND_ENABLE`        | automatic                              |
//! | `LAYERS`              | no layers                              |
//! | `ALPHA_FUNC`          | always pass, reference 0               |
//! | `BLEND`               | premultiplied source-over              |
//! | `DEPTH`               | test off, `Less`, writes on, `0..1`    |
//! | `POINT_SIZE`          | 0                                      |
//! | `CULL_FACE`           | no culling, counter-clockwise front    |
//! | `COLOR_MASK`          | all channels                           |
//! | `VERTEX_SNIPPETS`     | none                                   |
//! | `FRAGMENT_SNIPPETS`   | none                                   |

use alloc::vec;
use alloc::vec::Vec;

use bitflags::bitflags;
use kurbo::Affine;

use crate::id::{LayerId, TextureHandle};

bitflags! {
    /// Set of pipeline-level state groups.
    ///
    /// Used both as a node's own-override mask and as the difference bitmask
    /// between two pipelines.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct PipelineState: u32 {
        /// Constant vertex color.
        const COLOR = 1 << 0;
        /// Whether blending is enabled, disabled, or decided automatically.
        const BLEND_ENABLE = 1 << 1;
        /// Ordered list of layers (texture-unit order).
        const LAYERS = 1 << 2;
        /// Alpha test function and reference value.
        const ALPHA_FUNC = 1 << 3;
        /// Blend equations, factors, and constant.
        const BLEND = 1 << 4;
        /// Depth test configuration.
        const DEPTH = 1 << 5;
        /// Rasterized point size.
        const POINT_SIZE = 1 << 6;
        /// Face culling mode and front-face winding.
        const CULL_FACE = 1 << 7;
        /// Color write mask.
        const COLOR_MASK = 1 << 8;
        /// Vertex-stage hook snippets.
        const VERTEX_SNIPPETS = 1 << 9;
        /// Fragment-stage hook snippets.
        const FRAGMENT_SNIPPETS = 1 << 10;
    }
}

bitflags! {
    /// Set of per-layer state groups.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct LayerState: u32 {
        /// Texture target type.
        const TEXTURE_TYPE = 1 << 0;
        /// Bound texture.
        const TEXTURE = 1 << 1;
        /// Filtering and wrap modes.
        const SAMPLER = 1 << 2;
        /// Texture combine functions.
        const COMBINE = 1 << 3;
        /// Constant color used by combine functions.
        const COMBINE_CONSTANT = 1 << 4;
        /// Texture-coordinate transform.
        const MATRIX = 1 << 5;
        /// Whether point sprites generate texture coordinates.
        const POINT_SPRITE_COORDS = 1 << 6;
    }
}

bitflags! {
    /// Channels written to the color buffer.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct ColorMask: u8 {
        /// Red channel.
        const RED = 1 << 0;
        /// Green channel.
        const GREEN = 1 << 1;
        /// Blue channel.
        const BLUE = 1 << 2;
        /// Alpha channel.
        const ALPHA = 1 << 3;
    }
}

impl Default for ColorMask {
    fn default() -> Self {
        Self::all()
    }
}

// ---------------------------------------------------------------------------
// Pipeline value types
// ---------------------------------------------------------------------------

/// An RGBA color with straight (non-premultiplied) `f32` components.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Color {
    /// Red component.
    pub r: f32,
    /// Green component.
    pub g: f32,
    /// Blue component.
    pub b: f32,
    /// Alpha component.
    pub a: f32,
}

impl Color {
    /// Opaque white.
    pub const WHITE: Self = Self::new(1.0, 1.0, 1.0, 1.0);
    /// Opaque black.
    pub const BLACK: Self = Self::new(0.0, 0.0, 0.0, 1.0);
    /// Fully transparent black.
    pub const TRANSPARENT: Self = Self::new(0.0, 0.0, 0.0, 0.0);

    /// Creates a color from components.
    #[must_use]
    pub const fn new(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }

    /// Returns whether the alpha component is fully opaque.
    #[must_use]
    pub fn is_opaque(self) -> bool {
        self.a >= 1.0
    }
}

/// Blend-enable policy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum BlendEnable {
    /// Always blend.
    Enabled,
    /// Never blend.
    Disabled,
    /// Blend only when the resolved state can produce translucent output.
    #[default]
    Automatic,
}

/// Comparison function shared by the alpha and depth tests.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum CompareFunc {
    /// Never passes.
    Never,
    /// Passes if the incoming value is less than the stored one.
    Less,
    /// Passes if equal.
    Equal,
    /// Passes if less or equal.
    LessEqual,
    /// Passes if greater.
    Greater,
    /// Passes if not equal.
    NotEqual,
    /// Passes if greater or equal.
    GreaterEqual,
    /// Always passes.
    #[default]
    Always,
}

/// Alpha test configuration.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AlphaFuncState {
    /// Comparison applied to fragment alpha.
    pub func: CompareFunc,
    /// Reference value the alpha is compared against.
    pub reference: f32,
}

impl Default for AlphaFuncState {
    fn default() -> Self {
        Self {
            func: CompareFunc::Always,
            reference: 0.0,
        }
    }
}

/// Blend factor applied to a source or destination term.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BlendFactor {
    /// `0`.
    Zero,
    /// `1`.
    One,
    /// Source color.
    SrcColor,
    /// `1 - src`.
    OneMinusSrcColor,
    /// Source alpha.
    SrcAlpha,
    /// `1 - src.a`.
    OneMinusSrcAlpha,
    /// Destination color.
    DstColor,
    /// `1 - dst`.
    OneMinusDstColor,
    /// Destination alpha.
    DstAlpha,
    /// `1 - dst.a`.
    OneMinusDstAlpha,
    /// The blend constant.
    ConstantColor,
    /// `1 - constant`.
    OneMinusConstantColor,
    /// `min(src.a, 1 - dst.a)`.
    SrcAlphaSaturate,
}

/// Operator combining the weighted source and destination terms.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum BlendEquation {
    /// `src + dst`.
    #[default]
    Add,
    /// `src - dst`.
    Subtract,
    /// `dst - src`.
    ReverseSubtract,
}

/// Full blend configuration.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BlendState {
    /// Equation for the color channels.
    pub rgb_equation: BlendEquation,
    /// Equation for the alpha channel.
    pub alpha_equation: BlendEquation,
    /// Source factor for color channels.
    pub src_rgb: BlendFactor,
    /// Destination factor for color channels.
    pub dst_rgb: BlendFactor,
    /// Source factor for the alpha channel.
    pub src_alpha: BlendFactor,
    /// Destination factor for the alpha channel.
    pub dst_alpha: BlendFactor,
    /// Constant used by the `ConstantColor` factors.
    pub constant: Color,
}

impl BlendState {
    /// Premultiplied source-over: `src + dst * (1 - src.a)`.
    pub const PREMULTIPLIED_OVER: Self = Self {
        rgb_equation: BlendEquation::Add,
        alpha_equation: BlendEquation::Add,
        src_rgb: BlendFactor::One,
        dst_rgb: BlendFactor::OneMinusSrcAlpha,
        src_alpha: BlendFactor::One,
        dst_alpha: BlendFactor::OneMinusSrcAlpha,
        constant: Color::TRANSPARENT,
    };

    /// Source replaces destination.
    pub const REPLACE: Self = Self {
        rgb_equation: BlendEquation::Add,
        alpha_equation: BlendEquation::Add,
        src_rgb: BlendFactor::One,
        dst_rgb: BlendFactor::Zero,
        src_alpha: BlendFactor::One,
        dst_alpha: BlendFactor::Zero,
        constant: Color::TRANSPARENT,
    };

    /// Returns whether blending with this state leaves the source unchanged.
    #[must_use]
    pub fn is_replace(&self) -> bool {
        self.rgb_equation == BlendEquation::Add
            && self.alpha_equation == BlendEquation::Add
            && self.src_rgb == BlendFactor::One
            && self.dst_rgb == BlendFactor::Zero
            && self.src_alpha == BlendFactor::One
            && self.dst_alpha == BlendFactor::Zero
    }

    /// Returns whether the result only depends on source alpha for coverage,
    /// so an opaque source makes blending a no-op.
    #[must_use]
    pub fn is_source_over(&self) -> bool {
        self.rgb_equation == BlendEquation::Add
            && self.alpha_equation == BlendEquation::Add
            && matches!(self.src_rgb, BlendFactor::One | BlendFactor::SrcAlpha)
            && self.dst_rgb == BlendFactor::OneMinusSrcAlpha
            && matches!(self.src_alpha, BlendFactor::One | BlendFactor::SrcAlpha)
            && self.dst_alpha == BlendFactor::OneMinusSrcAlpha
    }
}

impl Default for BlendState {
    fn default() -> Self {
        Self::PREMULTIPLIED_OVER
    }
}

/// Depth test configuration.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DepthState {
    /// Whether the depth test runs at all.
    pub test_enabled: bool,
    /// Comparison against the stored depth.
    pub func: CompareFunc,
    /// Whether passing fragments write depth.
    pub write_enabled: bool,
    /// Near end of the depth range.
    pub range_near: f32,
    /// Far end of the depth range.
    pub range_far: f32,
}

impl Default for DepthState {
    fn default() -> Self {
        Self {
            test_enabled: false,
            func: CompareFunc::Less,
            write_enabled: true,
            range_near: 0.0,
            range_far: 1.0,
        }
    }
}

/// Which faces are culled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum CullMode {
    /// No culling.
    #[default]
    None,
    /// Cull front faces.
    Front,
    /// Cull back faces.
    Back,
    /// Cull everything.
    Both,
}

/// Vertex winding that identifies a front face.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Winding {
    /// Clockwise winding is front-facing.
    Clockwise,
    /// Counter-clockwise winding is front-facing.
    #[default]
    CounterClockwise,
}

/// Face culling configuration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct CullFaceState {
    /// Faces to cull.
    pub mode: CullMode,
    /// Front-face winding.
    pub front_winding: Winding,
}

/// Opaque identifier for a shader hook snippet.
///
/// Snippet bodies are owned by the caller; the state tree only tracks which
/// hooks are attached, in order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SnippetId(pub u32);

// ---------------------------------------------------------------------------
// Layer value types
// ---------------------------------------------------------------------------

/// Texture target type sampled by a layer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum TextureType {
    /// Two-dimensional texture.
    #[default]
    Tex2d,
    /// Three-dimensional texture.
    Tex3d,
    /// Rectangle texture with unnormalized coordinates.
    Rectangle,
}

/// Texture filter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Filter {
    /// Nearest texel.
    Nearest,
    /// Bilinear.
    #[default]
    Linear,
    /// Nearest texel from the nearest mip level.
    NearestMipmapNearest,
    /// Bilinear within the nearest mip level.
    LinearMipmapNearest,
    /// Nearest texel, blended between two mip levels.
    NearestMipmapLinear,
    /// Trilinear.
    LinearMipmapLinear,
}

/// Texture-coordinate wrap mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum WrapMode {
    /// Tile the texture.
    Repeat,
    /// Tile with mirroring.
    MirroredRepeat,
    /// Clamp coordinates to the edge texels.
    ClampToEdge,
    /// Let the device pick based on how the layer is drawn.
    #[default]
    Automatic,
}

/// Sampler configuration for one layer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct SamplerState {
    /// Minification filter.
    pub min_filter: Filter,
    /// Magnification filter.
    pub mag_filter: Filter,
    /// Wrap mode along `s`.
    pub wrap_s: WrapMode,
    /// Wrap mode along `t`.
    pub wrap_t: WrapMode,
    /// Wrap mode along `p`.
    pub wrap_p: WrapMode,
}

/// Function combining a layer's texture sample with the previous layer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum CombineFunc {
    /// Use the texture sample.
    Replace,
    /// Multiply with the previous result.
    #[default]
    Modulate,
    /// Add to the previous result.
    Add,
    /// Add and subtract one half.
    AddSigned,
    /// Subtract from the previous result.
    Subtract,
    /// Interpolate using the combine constant's alpha.
    Interpolate,
    /// Dot product of the color channels.
    Dot3Rgb,
    /// Dot product written to all channels.
    Dot3Rgba,
}

impl CombineFunc {
    /// Returns whether this function needs dot-product support on the device.
    #[must_use]
    pub const fn is_dot3(self) -> bool {
        matches!(self, Self::Dot3Rgb | Self::Dot3Rgba)
    }
}

/// Combine functions for a layer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct CombineState {
    /// Function for the color channels.
    pub rgb: CombineFunc,
    /// Function for the alpha channel.
    pub alpha: CombineFunc,
}

// ---------------------------------------------------------------------------
// Group values
// ---------------------------------------------------------------------------

/// A value for exactly one pipeline state group.
#[derive(Clone, Debug, PartialEq)]
pub enum PipelineValue {
    /// [`PipelineState::COLOR`].
    Color(Color),
    /// [`PipelineState::BLEND_ENABLE`].
    BlendEnable(BlendEnable),
    /// [`PipelineState::LAYERS`].
    Layers(Vec<LayerId>),
    /// [`PipelineState::ALPHA_FUNC`].
    AlphaFunc(AlphaFuncState),
    /// [`PipelineState::BLEND`].
    Blend(BlendState),
    /// [`PipelineState::DEPTH`].
    Depth(DepthState),
    /// [`PipelineState::POINT_SIZE`].
    PointSize(f32),
    /// [`PipelineState::CULL_FACE`].
    CullFace(CullFaceState),
    /// [`PipelineState::COLOR_MASK`].
    ColorMask(ColorMask),
    /// [`PipelineState::VERTEX_SNIPPETS`].
    VertexSnippets(Vec<SnippetId>),
    /// [`PipelineState::FRAGMENT_SNIPPETS`].
    FragmentSnippets(Vec<SnippetId>),
}

impl PipelineValue {
    /// Returns the group this value belongs to.
    #[must_use]
    pub const fn group(&self) -> PipelineState {
        match self {
            Self::Color(_) => PipelineState::COLOR,
            Self::BlendEnable(_) => PipelineState::BLEND_ENABLE,
            Self::Layers(_) => PipelineState::LAYERS,
            Self::AlphaFunc(_) => PipelineState::ALPHA_FUNC,
            Self::Blend(_) => PipelineState::BLEND,
            Self::Depth(_) => PipelineState::DEPTH,
            Self::PointSize(_) => PipelineState::POINT_SIZE,
            Self::CullFace(_) => PipelineState::CULL_FACE,
            Self::ColorMask(_) => PipelineState::COLOR_MASK,
            Self::VertexSnippets(_) => PipelineState::VERTEX_SNIPPETS,
            Self::FragmentSnippets(_) => PipelineState::FRAGMENT_SNIPPETS,
        }
    }

    /// Returns the default value of every group, as held by the root pipeline.
    #[must_use]
    pub fn defaults() -> Vec<Self> {
        vec![
            Self::Color(Color::WHITE),
            Self::BlendEnable(BlendEnable::Automatic),
            Self::Layers(Vec::new()),
            Self::AlphaFunc(AlphaFuncState::default()),
            Self::Blend(BlendState::default()),
            Self::Depth(DepthState::default()),
            Self::PointSize(0.0),
            Self::CullFace(CullFaceState::default()),
            Self::ColorMask(ColorMask::all()),
            Self::VertexSnippets(Vec::new()),
            Self::FragmentSnippets(Vec::new()),
        ]
    }
}

/// A value for exactly one layer state group.
#[derive(Clone, Debug, PartialEq)]
pub enum LayerValue {
    /// [`LayerState::TEXTURE_TYPE`].
    TextureType(TextureType),
    /// [`LayerState::TEXTURE`]; `None` samples nothing.
    Texture(Option<TextureHandle>),
    /// [`LayerState::SAMPLER`].
    Sampler(SamplerState),
    /// [`LayerState::COMBINE`].
    Combine(CombineState),
    /// [`LayerState::COMBINE_CONSTANT`].
    CombineConstant(Color),
    /// [`LayerState::MATRIX`].
    Matrix(Affine),
    /// [`LayerState::POINT_SPRITE_COORDS`].
    PointSpriteCoords(bool),
}

impl LayerValue {
    /// Returns the group this value belongs to.
    #[must_use]
    pub const fn group(&self) -> LayerState {
        match self {
            Self::TextureType(_) => LayerState::TEXTURE_TYPE,
            Self::Texture(_) => LayerState::TEXTURE,
            Self::Sampler(_) => LayerState::SAMPLER,
            Self::Combine(_) => LayerState::COMBINE,
            Self::CombineConstant(_) => LayerState::COMBINE_CONSTANT,
            Self::Matrix(_) => LayerState::MATRIX,
            Self::PointSpriteCoords(_) => LayerState::POINT_SPRITE_COORDS,
        }
    }

    /// Returns the default value of every group, as held by the root layer.
    #[must_use]
    pub fn defaults() -> Vec<Self> {
        vec![
            Self::TextureType(TextureType::Tex2d),
            Self::Texture(None),
            Self::Sampler(SamplerState::default()),
            Self::Combine(CombineState::default()),
            Self::CombineConstant(Color::TRANSPARENT),
            Self::Matrix(Affine::IDENTITY),
            Self::PointSpriteCoords(false),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_defaults_cover_every_group_once() {
        let mut seen = PipelineState::empty();
        for value in PipelineValue::defaults() {
            assert!(!seen.intersects(value.group()), "duplicate default");
            seen |= value.group();
        }
        assert_eq!(seen, PipelineState::all());
    }

    #[test]
    fn layer_defaults_cover_every_group_once() {
        let mut seen = LayerState::empty();
        for value in LayerValue::defaults() {
            assert!(!seen.intersects(value.group()), "duplicate default");
            seen |= value.group();
        }
        assert_eq!(seen, LayerState::all());
    }

    #[test]
    fn groups_are_single_bits() {
        for value in PipelineValue::defaults() {
            assert_eq!(value.group().bits().count_ones(), 1);
        }
        for value in LayerValue::defaults() {
            assert_eq!(value.group().bits().count_ones(), 1);
        }
    }

    #[test]
    fn blend_state_classification() {
        assert!(BlendState::REPLACE.is_replace());
        assert!(!BlendState::REPLACE.is_source_over());
        assert!(BlendState::PREMULTIPLIED_OVER.is_source_over());
        let additive = BlendState {
            dst_rgb: BlendFactor::One,
            dst_alpha: BlendFactor::One,
            ..BlendState::PREMULTIPLIED_OVER
        };
        assert!(!additive.is_source_over());
        assert!(!additive.is_replace());
    }
}
