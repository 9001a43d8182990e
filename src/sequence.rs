// Copyright (c) 2023, The rlambda contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use arrayvec::ArrayVec;

use crate::config::{HierarchicalBits, RateControlConfig};
use crate::model::RdModel;
use crate::util::clamp;

// Upper bound on the number of model levels: a 64-picture GOP has seven
//  temporal depths, plus the intra and non-reference slots.
pub(crate) const MAX_LEVELS: usize = 16;

// Fixed iteration budget of the bisection solver.
const BISECTION_STEPS: usize = 20;

// The solved base lambda is confined to this band.
const BASIC_LAMBDA_MIN: f64 = 0.1;
const BASIC_LAMBDA_MAX: f64 = 10000.0;

// Weights of the running level-1 lambda average.
const LAMBDA_HISTORY_WEIGHT: f64 = 0.5;
const LAMBDA_CURRENT_WEIGHT: f64 = 0.5;

/// Encode-wide rate control state: the remaining budget, the GOP position
/// weights, and one rate-distortion model per hierarchy level.
pub(crate) struct SequenceRateState {
  pub total_frames: usize,
  pub gop_size: usize,
  pub width: usize,
  pub height: usize,
  pub ctu_width: usize,
  pub ctu_height: usize,
  pub pic_width_in_ctus: usize,
  pub pic_height_in_ctus: usize,
  pub num_levels: usize,
  /// Integer weight per GOP position; refreshed per GOP in adaptive mode.
  pub bits_ratio: Vec<i64>,
  pub level_of_gop_position: Vec<usize>,
  /// Whole-sequence bit budget.
  pub target_bits: i64,
  pub frames_left: usize,
  pub bits_left: i64,
  pub alpha_update_rate: f64,
  pub beta_update_rate: f64,
  /// Running average of the lambda used at the top inter level; drives the
  /// adaptive weight re-solve once warm.
  pub last_lambda: f64,
  pub adaptive_ratio: bool,
  pub low_delay: bool,
  level_params: ArrayVec<RdModel, MAX_LEVELS>,
  /// `[level][ctu]` model table, present when the caller asked for
  /// CTU-granular adaptation.
  ctu_params: Option<Vec<Vec<RdModel>>>,
}

impl SequenceRateState {
  pub fn new(cfg: &RateControlConfig) -> SequenceRateState {
    let pixels = cfg.pixels_per_picture();
    let target_bits = (cfg.total_frames as f64 * cfg.target_bitrate as f64
      / cfg.frame_rate) as i64;
    let (alpha_update_rate, beta_update_rate) = cfg.update_rates();
    let num_levels = cfg.num_levels();
    let ctus =
      cfg.pic_width_in_ctus() * cfg.pic_height_in_ctus();

    // Level 0 is the intra slot; every other level starts from the common
    //  inter fit.
    let mut level_params = ArrayVec::new();
    level_params.push(RdModel::intra());
    for _ in 1..num_levels {
      level_params.push(RdModel::inter());
    }
    let ctu_params = cfg.ctu_separate_model.then(|| {
      level_params.iter().map(|&m| vec![m; ctus]).collect::<Vec<_>>()
    });

    log::debug!(
      "rc init: {} frames, {} bits total, {:.4} bpp, {} levels",
      cfg.total_frames,
      target_bits,
      cfg.target_bpp(),
      num_levels
    );

    SequenceRateState {
      total_frames: cfg.total_frames,
      gop_size: cfg.gop_size,
      width: cfg.width,
      height: cfg.height,
      ctu_width: cfg.ctu_width,
      ctu_height: cfg.ctu_height,
      pic_width_in_ctus: cfg.pic_width_in_ctus(),
      pic_height_in_ctus: cfg.pic_height_in_ctus(),
      num_levels,
      bits_ratio: cfg.initial_bits_ratio(),
      level_of_gop_position: cfg.level_of_gop_position(),
      target_bits,
      frames_left: cfg.total_frames,
      bits_left: target_bits,
      alpha_update_rate,
      beta_update_rate,
      last_lambda: 0.0,
      adaptive_ratio: cfg.hierarchical_bits == HierarchicalBits::Adaptive,
      low_delay: cfg.is_low_delay(),
      level_params,
      ctu_params,
    }
  }

  pub fn pixels_per_picture(&self) -> usize {
    self.width * self.height
  }

  pub fn ctus_per_picture(&self) -> usize {
    self.pic_width_in_ctus * self.pic_height_in_ctus
  }

  pub fn average_bits_per_picture(&self) -> i64 {
    self.target_bits / self.total_frames as i64
  }

  pub fn pic_param(&self, level: usize) -> RdModel {
    self.level_params[level.min(self.num_levels - 1)]
  }

  pub fn set_pic_param(&mut self, level: usize, model: RdModel) {
    let level = level.min(self.num_levels - 1);
    self.level_params[level] = model;
  }

  pub fn ctu_separate_model(&self) -> bool {
    self.ctu_params.is_some()
  }

  /// The model driving CTU `ctu` at `level`: the CTU's own pair when the
  /// separate table is enabled, the picture-level pair otherwise.
  pub fn ctu_param(&self, level: usize, ctu: usize) -> RdModel {
    let level = level.min(self.num_levels - 1);
    match &self.ctu_params {
      Some(table) => table[level][ctu],
      None => self.level_params[level],
    }
  }

  pub fn set_ctu_param(&mut self, level: usize, ctu: usize, model: RdModel) {
    let level = level.min(self.num_levels - 1);
    if let Some(table) = &mut self.ctu_params {
      table[level][ctu] = model;
    }
  }

  pub fn update_after_picture(&mut self, bits: i64) {
    self.bits_left -= bits;
    self.frames_left = self.frames_left.saturating_sub(1);
  }

  /// Folds the lambda of a completed top-level inter picture into the
  /// running average that seeds the adaptive weight re-solve.
  pub fn blend_last_lambda(&mut self, lambda: f64) {
    let current = clamp(lambda, BASIC_LAMBDA_MIN, BASIC_LAMBDA_MAX);
    self.last_lambda = LAMBDA_HISTORY_WEIGHT * self.last_lambda
      + LAMBDA_CURRENT_WEIGHT * current;
  }

  // Target lambda of each GOP position relative to the solved base lambda.
  // In a hierarchy each level down costs one quantizer step; low-delay
  //  structures instead widen the band as the operating lambda rises.
  pub fn lambda_ratios(&self, num_pictures: usize) -> Vec<f64> {
    (0..num_pictures)
      .map(|pos| {
        let level = self.level_of_gop_position[pos];
        if level <= 1 {
          1.0
        } else if self.low_delay {
          let r = clamp(0.725 * self.last_lambda.ln() + 0.7963, 1.0, 4.0);
          if level == 2 {
            r
          } else {
            1.3 * r
          }
        } else {
          2f64.powf((level - 1) as f64 / 3.0)
        }
      })
      .collect()
  }

  // Coefficients of the per-position rate equation
  //  bpp_i = a_i * x^b_i, where x is the base lambda and the position's
  //  own lambda is ratio_i * x.
  pub fn equation_coefficients(
    &self, ratios: &[f64],
  ) -> (Vec<f64>, Vec<f64>) {
    let mut coeff_a = Vec::with_capacity(ratios.len());
    let mut coeff_b = Vec::with_capacity(ratios.len());
    for (pos, &ratio) in ratios.iter().enumerate() {
      let model = self.pic_param(self.level_of_gop_position[pos]);
      coeff_a.push((ratio / model.alpha()).powf(1.0 / model.beta()));
      coeff_b.push(1.0 / model.beta());
    }
    (coeff_a, coeff_b)
  }

  /// Refreshes the position weights from solved per-position rates. A
  /// weight never drops below 1 so the integer split stays well-defined.
  pub fn set_all_bit_ratio(
    &mut self, basic_lambda: f64, coeff_a: &[f64], coeff_b: &[f64],
  ) {
    let pixels = self.pixels_per_picture() as f64;
    for (pos, (a, b)) in coeff_a.iter().zip(coeff_b).enumerate() {
      let bits = (a * basic_lambda.powf(*b) * pixels) as i64;
      self.bits_ratio[pos] = bits.max(1);
    }
    log::debug!("rc adaptive weights: {:?}", &self.bits_ratio);
  }
}

/// Solves `sum(a_i * x^b_i) = target_bpp` for `x` by bisection. All
/// exponents are negative (they are `1/beta` of an inter model), so the
/// left side decreases in `x` and the bracket halves each step.
pub(crate) fn solve_basic_lambda(
  coeff_a: &[f64], coeff_b: &[f64], target_bpp: f64,
) -> f64 {
  let mut lo = BASIC_LAMBDA_MIN;
  let mut hi = BASIC_LAMBDA_MAX;
  let mut mid = (lo + hi) / 2.0;
  for _ in 0..BISECTION_STEPS {
    mid = (lo + hi) / 2.0;
    let bpp: f64 = coeff_a
      .iter()
      .zip(coeff_b)
      .map(|(a, b)| a * mid.powf(*b))
      .sum();
    if bpp > target_bpp {
      lo = mid;
    } else {
      hi = mid;
    }
  }
  mid
}
