// Copyright (c) 2023, The rlambda contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use thiserror::Error;

pub(crate) const MAX_GOP_SIZE: usize = 64;

/// Enumeration of possible invalid configuration errors.
#[derive(Debug, Clone, Copy, PartialEq, Error)]
#[non_exhaustive]
pub enum InvalidConfig {
  /// The width is invalid.
  #[error("invalid width {0} (expected >= 16, <= 65535)")]
  InvalidWidth(usize),
  /// The height is invalid.
  #[error("invalid height {0} (expected >= 16, <= 65535)")]
  InvalidHeight(usize),
  /// The coding-tree unit size is invalid.
  #[error("invalid CTU size {0} (expected power of two, >= 16, <= 128)")]
  InvalidCtuSize(usize),
  /// The target bitrate is invalid.
  #[error("invalid target bitrate {0} (expected > 0)")]
  InvalidTargetBitrate(i64),
  /// The frame rate is invalid.
  #[error("invalid frame rate {0} (expected finite, > 0)")]
  InvalidFrameRate(f64),
  /// The total frame count is invalid.
  #[error("invalid total frame count {0} (expected > 0)")]
  InvalidTotalFrames(usize),
  /// The GOP size is invalid.
  #[error("invalid GOP size {0} (expected >= 1, <= {MAX_GOP_SIZE})")]
  InvalidGopSize(usize),
  /// The GOP pattern does not cover the GOP.
  #[error("GOP pattern length {actual} does not match GOP size {expected}")]
  GopPatternMismatch {
    /// Number of entries in the supplied pattern.
    actual: usize,
    /// The configured GOP size.
    expected: usize,
  },
}

/// How the GOP bit budget is distributed across picture positions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum HierarchicalBits {
  /// Every position receives the same weight.
  #[default]
  Flat,
  /// Hand-tuned hierarchical weights keyed on the GOP structure, biasing
  /// bits toward referenced pictures.
  Fixed,
  /// Same weights, plus a per-GOP re-solve of the weights from the running
  /// rate-distortion models.
  Adaptive,
}

/// One position of the GOP pattern, in coding order.
#[derive(Clone, Copy, Debug)]
pub struct GopEntry {
  /// Display offset of the picture relative to the GOP start.
  pub poc_offset: usize,
  /// Whether the picture is used as a reference.
  pub referenced: bool,
  /// Temporal sub-layer the picture belongs to.
  pub temporal_id: usize,
}

/// Rate control configuration.
///
/// Structural parameters of the encode the controller is driving: the
/// overall bit budget, the picture geometry, and the GOP prediction
/// structure. Everything else the controller learns online.
#[derive(Clone, Debug)]
pub struct RateControlConfig {
  /// Number of frames in the encode.
  pub total_frames: usize,
  /// The target bitrate in bits per second.
  pub target_bitrate: i64,
  /// Frames per second.
  pub frame_rate: f64,
  /// Width of the frames in pixels.
  pub width: usize,
  /// Height of the frames in pixels.
  pub height: usize,
  /// Coding-tree unit width in pixels.
  pub ctu_width: usize,
  /// Coding-tree unit height in pixels.
  pub ctu_height: usize,
  /// Number of pictures in one GOP.
  pub gop_size: usize,
  /// GOP budget distribution policy.
  pub hierarchical_bits: HierarchicalBits,
  /// Track a separate `(alpha, beta)` pair per CTU instead of sharing the
  /// picture-level pair.
  pub ctu_separate_model: bool,
  /// The GOP pattern, one entry per position in coding order.
  pub gop_pattern: Vec<GopEntry>,
}

impl Default for RateControlConfig {
  fn default() -> Self {
    RateControlConfig {
      total_frames: 300,
      target_bitrate: 1_000_000,
      frame_rate: 30.0,
      width: 640,
      height: 480,
      ctu_width: 64,
      ctu_height: 64,
      gop_size: 4,
      hierarchical_bits: HierarchicalBits::default(),
      ctu_separate_model: false,
      gop_pattern: Self::low_delay_pattern(4),
    }
  }
}

impl RateControlConfig {
  /// Creates a default configuration.
  pub fn new() -> Self {
    Default::default()
  }

  /// Sets the number of frames in the encode.
  pub fn with_total_frames(mut self, total_frames: usize) -> Self {
    self.total_frames = total_frames;
    self
  }

  /// Sets the target bitrate in bits per second.
  pub fn with_target_bitrate(mut self, bitrate: i64) -> Self {
    self.target_bitrate = bitrate;
    self
  }

  /// Sets the frame rate.
  pub fn with_frame_rate(mut self, frame_rate: f64) -> Self {
    self.frame_rate = frame_rate;
    self
  }

  /// Sets the picture dimensions in pixels.
  pub fn with_dimensions(mut self, width: usize, height: usize) -> Self {
    self.width = width;
    self.height = height;
    self
  }

  /// Sets a square coding-tree unit size in pixels.
  pub fn with_ctu_size(mut self, ctu_size: usize) -> Self {
    self.ctu_width = ctu_size;
    self.ctu_height = ctu_size;
    self
  }

  /// Sets the GOP budget distribution policy.
  pub fn with_hierarchical_bits(mut self, mode: HierarchicalBits) -> Self {
    self.hierarchical_bits = mode;
    self
  }

  /// Enables or disables the per-CTU model table.
  pub fn with_ctu_separate_model(mut self, enabled: bool) -> Self {
    self.ctu_separate_model = enabled;
    self
  }

  /// Sets an explicit GOP pattern (and the GOP size to match).
  pub fn with_gop_pattern(mut self, pattern: Vec<GopEntry>) -> Self {
    self.gop_size = pattern.len();
    self.gop_pattern = pattern;
    self
  }

  /// Configures a low-delay GOP of `size` pictures: every picture
  /// references the previous one and display order equals coding order.
  pub fn with_low_delay_gop(self, size: usize) -> Self {
    self.with_gop_pattern(Self::low_delay_pattern(size))
  }

  /// Configures the standard 8-picture random-access hierarchy.
  pub fn with_random_access_gop8(self) -> Self {
    self.with_gop_pattern(Self::random_access_pattern8())
  }

  /// The low-delay pattern of `size` sequential referenced pictures.
  pub fn low_delay_pattern(size: usize) -> Vec<GopEntry> {
    (1..=size)
      .map(|poc| GopEntry { poc_offset: poc, referenced: true, temporal_id: 0 })
      .collect()
  }

  /// The 8-picture random-access hierarchy, in coding order.
  pub fn random_access_pattern8() -> Vec<GopEntry> {
    const POC: [usize; 8] = [8, 4, 2, 1, 3, 6, 5, 7];
    const TID: [usize; 8] = [0, 1, 2, 3, 3, 2, 3, 3];
    const REFD: [bool; 8] =
      [true, true, true, false, false, true, false, false];
    (0..8)
      .map(|i| GopEntry {
        poc_offset: POC[i],
        referenced: REFD[i],
        temporal_id: TID[i],
      })
      .collect()
  }

  /// Validates the configuration.
  ///
  /// # Errors
  ///
  /// Returns `InvalidConfig` describing the first offending field.
  pub fn validate(&self) -> Result<(), InvalidConfig> {
    use InvalidConfig::*;

    if self.width < 16 || self.width > u16::MAX as usize {
      return Err(InvalidWidth(self.width));
    }
    if self.height < 16 || self.height > u16::MAX as usize {
      return Err(InvalidHeight(self.height));
    }
    for ctu in [self.ctu_width, self.ctu_height] {
      if !ctu.is_power_of_two() || !(16..=128).contains(&ctu) {
        return Err(InvalidCtuSize(ctu));
      }
    }
    if self.target_bitrate <= 0 {
      return Err(InvalidTargetBitrate(self.target_bitrate));
    }
    if !self.frame_rate.is_finite() || self.frame_rate <= 0.0 {
      return Err(InvalidFrameRate(self.frame_rate));
    }
    if self.total_frames == 0 {
      return Err(InvalidTotalFrames(self.total_frames));
    }
    if self.gop_size == 0 || self.gop_size > MAX_GOP_SIZE {
      return Err(InvalidGopSize(self.gop_size));
    }
    if self.gop_pattern.len() != self.gop_size {
      return Err(GopPatternMismatch {
        actual: self.gop_pattern.len(),
        expected: self.gop_size,
      });
    }
    Ok(())
  }

  pub(crate) fn pic_width_in_ctus(&self) -> usize {
    (self.width + self.ctu_width - 1) / self.ctu_width
  }

  pub(crate) fn pic_height_in_ctus(&self) -> usize {
    (self.height + self.ctu_height - 1) / self.ctu_height
  }

  pub(crate) fn pixels_per_picture(&self) -> usize {
    self.width * self.height
  }

  pub(crate) fn target_bpp(&self) -> f64 {
    self.target_bitrate as f64
      / self.frame_rate
      / self.pixels_per_picture() as f64
  }

  // A pattern whose display order equals its coding order has no
  //  reordering delay.
  pub(crate) fn is_low_delay(&self) -> bool {
    self
      .gop_pattern
      .windows(2)
      .all(|pair| pair[0].poc_offset < pair[1].poc_offset)
  }

  // Distinct temporal depths, plus one slot for intra pictures (level 0)
  //  and one for non-referenced pictures (the last level).
  pub(crate) fn num_levels(&self) -> usize {
    let hierarchy = match self.hierarchical_bits {
      HierarchicalBits::Flat => 1,
      _ => (self.gop_size as f64).log2().round() as usize + 1,
    };
    hierarchy + 2
  }

  // Maps each GOP position to the level whose model drives it. Hand tables
  //  exist for the two structures the weights were tuned on; anything else
  //  follows the signaled temporal layering.
  pub(crate) fn level_of_gop_position(&self) -> Vec<usize> {
    let non_ref = self.num_levels() - 1;
    let mut levels = vec![1usize; self.gop_size];
    if self.hierarchical_bits != HierarchicalBits::Flat {
      if self.gop_size == 4 && self.is_low_delay() {
        levels.copy_from_slice(&[3, 2, 3, 1]);
      } else if self.gop_size == 8 && !self.is_low_delay() {
        levels.copy_from_slice(&[1, 2, 3, 4, 4, 3, 4, 4]);
      } else {
        // Untabled structures lean on the signaled temporal layering.
        for (level, entry) in levels.iter_mut().zip(&self.gop_pattern) {
          *level = (entry.temporal_id + 1).min(non_ref - 1);
        }
      }
    }
    for (level, entry) in levels.iter_mut().zip(&self.gop_pattern) {
      if !entry.referenced {
        *level = non_ref;
      }
    }
    levels
  }

  // Hand-tuned position weights. Sparser encodes push a still larger share
  //  of the GOP to the key picture, where those bits buy the most.
  pub(crate) fn initial_bits_ratio(&self) -> Vec<i64> {
    if self.hierarchical_bits == HierarchicalBits::Flat {
      return vec![1; self.gop_size];
    }
    let bpp = self.target_bpp();
    if self.gop_size == 4 && self.is_low_delay() {
      let table: [i64; 4] = if bpp > 0.2 {
        [2, 3, 2, 6]
      } else if bpp > 0.1 {
        [2, 3, 2, 10]
      } else if bpp > 0.05 {
        [2, 3, 2, 12]
      } else {
        [2, 3, 2, 14]
      };
      table.to_vec()
    } else if self.gop_size == 8 && !self.is_low_delay() {
      let table: [i64; 8] = if bpp > 0.2 {
        [15, 5, 4, 1, 1, 4, 1, 1]
      } else if bpp > 0.1 {
        [20, 6, 4, 1, 1, 4, 1, 1]
      } else if bpp > 0.05 {
        [25, 7, 4, 1, 1, 4, 1, 1]
      } else {
        [30, 8, 4, 1, 1, 4, 1, 1]
      };
      table.to_vec()
    } else {
      log::warn!(
        "no hierarchical weight table for GOP size {} ({}), using flat weights",
        self.gop_size,
        if self.is_low_delay() { "low delay" } else { "random access" }
      );
      vec![1; self.gop_size]
    }
  }

  // Damping constants for the model feedback. Sparse high-compression
  //  regimes see far noisier per-picture samples and need more averaging.
  pub(crate) fn update_rates(&self) -> (f64, f64) {
    let bpp = self.target_bpp();
    if bpp < 0.03 {
      (0.01, 0.005)
    } else if bpp < 0.08 {
      (0.05, 0.025)
    } else if bpp < 0.2 {
      (0.1, 0.05)
    } else if bpp < 0.5 {
      (0.2, 0.1)
    } else {
      (0.4, 0.2)
    }
  }
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn default_config_is_valid() {
    assert_eq!(RateControlConfig::new().validate(), Ok(()));
  }

  #[test]
  fn rejects_degenerate_fields() {
    let cfg = RateControlConfig::new().with_dimensions(8, 480);
    assert_eq!(cfg.validate(), Err(InvalidConfig::InvalidWidth(8)));
    let cfg = RateControlConfig::new().with_ctu_size(48);
    assert_eq!(cfg.validate(), Err(InvalidConfig::InvalidCtuSize(48)));
    let cfg = RateControlConfig::new().with_target_bitrate(0);
    assert_eq!(cfg.validate(), Err(InvalidConfig::InvalidTargetBitrate(0)));
    let cfg = RateControlConfig::new().with_frame_rate(0.0);
    assert_eq!(cfg.validate(), Err(InvalidConfig::InvalidFrameRate(0.0)));
    let mut cfg = RateControlConfig::new();
    cfg.gop_size = 8;
    assert_eq!(
      cfg.validate(),
      Err(InvalidConfig::GopPatternMismatch { actual: 4, expected: 8 })
    );
  }

  #[test]
  fn ctu_grid_rounds_up() {
    let cfg = RateControlConfig::new().with_dimensions(1920, 1080);
    assert_eq!(cfg.pic_width_in_ctus(), 30);
    assert_eq!(cfg.pic_height_in_ctus(), 17);
  }

  #[test]
  fn detects_gop_structures() {
    let ld = RateControlConfig::new().with_low_delay_gop(4);
    assert!(ld.is_low_delay());
    let ra = RateControlConfig::new().with_random_access_gop8();
    assert!(!ra.is_low_delay());
  }

  #[test]
  fn level_maps() {
    let ld = RateControlConfig::new()
      .with_low_delay_gop(4)
      .with_hierarchical_bits(HierarchicalBits::Fixed);
    assert_eq!(ld.num_levels(), 5);
    assert_eq!(ld.level_of_gop_position(), vec![3, 2, 3, 1]);

    let ra = RateControlConfig::new()
      .with_random_access_gop8()
      .with_hierarchical_bits(HierarchicalBits::Fixed);
    assert_eq!(ra.num_levels(), 6);
    // Non-referenced positions fall through to the last level.
    assert_eq!(ra.level_of_gop_position(), vec![1, 2, 3, 5, 5, 3, 5, 5]);

    let flat = RateControlConfig::new().with_low_delay_gop(4);
    assert_eq!(flat.num_levels(), 3);
    assert_eq!(flat.level_of_gop_position(), vec![1, 1, 1, 1]);
  }

  #[test]
  fn hierarchical_weights_follow_bpp_class() {
    // 640x480 at 30fps: 1 Mbps is ~0.109 bpp, 200 kbps is ~0.022 bpp.
    let cfg = RateControlConfig::new()
      .with_low_delay_gop(4)
      .with_hierarchical_bits(HierarchicalBits::Fixed);
    assert_eq!(cfg.initial_bits_ratio(), vec![2, 3, 2, 10]);
    let cfg = cfg.with_target_bitrate(200_000);
    assert_eq!(cfg.initial_bits_ratio(), vec![2, 3, 2, 14]);
  }

  #[test]
  fn update_rates_follow_bpp_class() {
    let cfg = RateControlConfig::new();
    assert_eq!(cfg.update_rates(), (0.1, 0.05));
    let cfg = cfg.with_target_bitrate(200_000);
    assert_eq!(cfg.update_rates(), (0.01, 0.005));
  }
}
