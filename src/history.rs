// Copyright (c) 2023, The rlambda contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use std::collections::VecDeque;

use crate::picture::PictureRateControl;

// Clamping only ever looks a few pictures back; a deeper archive would
//  just slow the level scans down.
pub(crate) const MAX_HISTORY: usize = 32;

/// Bounded archive of finalized pictures, most recent last. The clamping
/// stages and the header estimate read it; nothing writes into an archived
/// picture.
pub(crate) struct PictureHistory {
  pics: VecDeque<PictureRateControl>,
}

impl PictureHistory {
  pub fn new() -> PictureHistory {
    PictureHistory { pics: VecDeque::with_capacity(MAX_HISTORY) }
  }

  pub fn push(&mut self, pic: PictureRateControl) {
    if self.pics.len() >= MAX_HISTORY {
      self.pics.pop_front();
    }
    self.pics.push_back(pic);
  }

  /// Lambda of the most recently finalized picture at `level`.
  pub fn last_lambda_for_level(&self, level: usize) -> Option<f64> {
    self
      .pics
      .iter()
      .rev()
      .find(|p| p.frame_level() == level)
      .map(|p| p.actual_lambda())
  }

  /// QP of the most recently finalized picture at `level`, skipping
  /// pictures that reported no usable average.
  pub fn last_qp_for_level(&self, level: usize) -> Option<i32> {
    self
      .pics
      .iter()
      .rev()
      .filter(|p| p.frame_level() == level)
      .find_map(|p| p.actual_qp())
  }

  /// Lambda of the most recently finalized picture of any level.
  pub fn last_lambda(&self) -> Option<f64> {
    self.pics.back().map(|p| p.actual_lambda())
  }

  /// QP of the most recent picture that reported a usable average.
  pub fn last_qp(&self) -> Option<i32> {
    self.pics.iter().rev().find_map(|p| p.actual_qp())
  }

  /// Mean header cost observed at `level`; 0 until a sample exists.
  pub fn mean_header_bits_for_level(&self, level: usize) -> i64 {
    let mut total = 0i64;
    let mut count = 0i64;
    for pic in self.pics.iter().filter(|p| p.frame_level() == level) {
      total += pic.actual_header_bits();
      count += 1;
    }
    if count == 0 {
      0
    } else {
      total / count
    }
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::config::RateControlConfig;
  use crate::gop::GopBudget;
  use crate::picture::SliceType;
  use crate::sequence::SequenceRateState;

  fn finalized(
    seq: &mut SequenceRateState, level: usize, header_bits: i64, qp: i32,
    lambda: f64,
  ) -> PictureRateControl {
    let gop = GopBudget::new(seq, 4);
    let mut pic = PictureRateControl::new(
      seq,
      gop.bits_left,
      &gop.ratios,
      0,
      gop.preallocated(0),
      &PictureHistory::new(),
      level,
    );
    pic.estimate_lambda(seq, &PictureHistory::new(), SliceType::P);
    pic.update_after_picture(
      seq,
      header_bits,
      header_bits + 5000,
      qp,
      lambda,
      SliceType::P,
    );
    pic
  }

  #[test]
  fn evicts_oldest_at_capacity() {
    let cfg = RateControlConfig::new();
    let mut seq = SequenceRateState::new(&cfg);
    let mut history = PictureHistory::new();
    for i in 0..MAX_HISTORY + 5 {
      history.push(finalized(&mut seq, 1, 100 + i as i64, 30, 60.0));
    }
    assert_eq!(history.pics.len(), MAX_HISTORY);
    // The five oldest header samples (100..=104) are gone from the mean:
    //  what is left averages 105..=136.
    let mean = history.mean_header_bits_for_level(1);
    assert_eq!(mean, 120);
  }

  #[test]
  fn level_queries_pick_most_recent() {
    let cfg = RateControlConfig::new();
    let mut seq = SequenceRateState::new(&cfg);
    let mut history = PictureHistory::new();
    history.push(finalized(&mut seq, 1, 100, 30, 60.0));
    history.push(finalized(&mut seq, 2, 100, 34, 120.0));
    history.push(finalized(&mut seq, 1, 100, 28, 45.0));
    assert_eq!(history.last_lambda_for_level(1), Some(45.0));
    assert_eq!(history.last_qp_for_level(1), Some(28));
    assert_eq!(history.last_lambda(), Some(45.0));
    assert_eq!(history.last_qp(), Some(28));
    assert_eq!(history.last_lambda_for_level(3), None);
  }

  #[test]
  fn invalid_qp_is_skipped() {
    let cfg = RateControlConfig::new();
    let mut seq = SequenceRateState::new(&cfg);
    let mut history = PictureHistory::new();
    history.push(finalized(&mut seq, 1, 100, 30, 60.0));
    history.push(finalized(&mut seq, 1, 100, -1, 55.0));
    assert_eq!(history.last_qp_for_level(1), Some(30));
    assert_eq!(history.last_lambda_for_level(1), Some(55.0));
  }

  #[test]
  fn empty_history_reports_nothing() {
    let history = PictureHistory::new();
    assert_eq!(history.last_lambda(), None);
    assert_eq!(history.last_qp_for_level(0), None);
    assert_eq!(history.mean_header_bits_for_level(0), 0);
  }
}
