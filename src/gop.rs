// Copyright (c) 2023, The rlambda contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use crate::sequence::{solve_basic_lambda, SequenceRateState};

// The sequence-level deficit or surplus is paid back over this many
//  upcoming frames rather than dumped onto the next GOP.
const SMOOTHING_WINDOW: usize = 40;

// A GOP always gets at least a nominal budget.
const GOP_MIN_BITS: i64 = 200;

/// Fixed bit allocation for one GOP, split once at creation across its
/// picture positions.
pub(crate) struct GopBudget {
  pub num_pictures: usize,
  pub target_bits: i64,
  pub pictures_left: usize,
  pub bits_left: i64,
  /// Weights actually used for the split, one per position.
  pub ratios: Vec<i64>,
  per_picture_target_bits: Vec<i64>,
}

impl GopBudget {
  /// Carves the next GOP's budget out of the sequence's remaining bits.
  /// In adaptive mode the position weights are re-solved first, once the
  /// running lambda is warm.
  pub fn new(seq: &mut SequenceRateState, num_pictures: usize) -> GopBudget {
    let target_bits = estimate_target_bits(seq, num_pictures);

    if seq.adaptive_ratio && seq.last_lambda > 0.1 {
      let target_bpp = target_bits as f64 / seq.pixels_per_picture() as f64;
      let ratios = seq.lambda_ratios(num_pictures);
      let (coeff_a, coeff_b) = seq.equation_coefficients(&ratios);
      let basic_lambda =
        solve_basic_lambda(&coeff_a, &coeff_b, target_bpp);
      seq.set_all_bit_ratio(basic_lambda, &coeff_a, &coeff_b);
    }

    let ratios = seq.bits_ratio[..num_pictures].to_vec();
    let per_picture_target_bits = split_budget(target_bits, &ratios);
    log::debug!(
      "gop budget: {} bits over {} pictures {:?}",
      target_bits,
      num_pictures,
      per_picture_target_bits
    );

    GopBudget {
      num_pictures,
      target_bits,
      pictures_left: num_pictures,
      bits_left: target_bits,
      ratios,
      per_picture_target_bits,
    }
  }

  /// The next position to be coded, in coding order.
  pub fn position(&self) -> usize {
    self.num_pictures - self.pictures_left
  }

  /// The share assigned to `position` when the GOP was created. Never
  /// recomputed mid-GOP.
  pub fn preallocated(&self, position: usize) -> i64 {
    self.per_picture_target_bits[position]
  }

  pub fn update_after_picture(&mut self, bits: i64) {
    self.bits_left -= bits;
    self.pictures_left = self.pictures_left.saturating_sub(1);
  }
}

fn estimate_target_bits(
  seq: &SequenceRateState, num_pictures: usize,
) -> i64 {
  let real_influence = SMOOTHING_WINDOW.min(seq.frames_left).max(1) as i64;
  let average = seq.average_bits_per_picture();
  let current = (seq.bits_left
    - average * (seq.frames_left as i64 - real_influence))
    / real_influence;
  (current * num_pictures as i64).max(GOP_MIN_BITS)
}

// Proportional integer split that conserves the total exactly: the
//  division remainder goes to the heaviest position.
fn split_budget(target_bits: i64, ratios: &[i64]) -> Vec<i64> {
  let total: i64 = ratios.iter().sum();
  let mut shares: Vec<i64> =
    ratios.iter().map(|r| target_bits * r / total).collect();
  let remainder = target_bits - shares.iter().sum::<i64>();
  let heaviest = ratios
    .iter()
    .enumerate()
    .max_by_key(|(_, &r)| r)
    .map(|(i, _)| i)
    .unwrap_or(0);
  shares[heaviest] += remainder;
  shares
}
