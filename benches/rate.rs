// Copyright (c) 2023, The rlambda contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use criterion::*;
use rlambda::{HierarchicalBits, RateControl, RateControlConfig, SliceType};

// One full 1080p picture: estimate, CTU cascade, feedback.
pub fn picture_cycle(c: &mut Criterion) {
  let cfg = RateControlConfig::new()
    .with_dimensions(1920, 1080)
    .with_frame_rate(30.0)
    .with_target_bitrate(4_000_000)
    .with_total_frames(600)
    .with_hierarchical_bits(HierarchicalBits::Fixed)
    .with_low_delay_gop(4);
  let ctus = 30 * 17;

  c.bench_function("picture_cycle_1080p", move |b| {
    b.iter(|| {
      let mut rc = RateControl::new(&cfg).unwrap();
      rc.init_gop(4);
      rc.init_picture(1);
      let lambda = rc.estimate_picture_lambda(SliceType::P);
      let pic_qp = rc.estimate_picture_qp(lambda);
      let target = rc.picture_target_bits();
      for idx in 0..ctus {
        let bpp = rc.ctu_target_bpp();
        let ctu_lambda = rc.ctu_estimate_lambda(bpp);
        let ctu_qp = rc.ctu_estimate_qp(ctu_lambda, pic_qp);
        rc.update_after_ctu(idx, target / ctus as i64, ctu_qp, ctu_lambda);
      }
      rc.update_after_picture(800, target, pic_qp, lambda, SliceType::P);
      rc.bits_left()
    })
  });
}

criterion_group!(rate, picture_cycle);
criterion_main!(rate);
