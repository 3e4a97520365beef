//! # SIMD Distance Kernels
//!
//! Squared-L2 and inner-product kernels over `f32` buffers, dispatched once
//! to the widest instruction set the host supports:
//!
//! - **x86_64**: AVX-512F, AVX2+FMA, SSE4.1 (detected at first use)
//! - **aarch64**: NEON (always available)
//! - **Fallback**: portable scalar
//!
//! Every vector variant consumes the input in blocks of 16 lanes and
//! finishes with a scalar tail, so any dimension is handled. A fixed
//! dispatch choice is bit-for-bit deterministic; different widths may
//! disagree by a few ULP due to reassociation.
//!
//! The `FLATGRAPH_SIMD` environment variable (`avx512`, `avx2`, `sse`,
//! `neon`, `scalar`) forces a particular width for testing. A request the
//! host cannot satisfy falls back to the detected level.

use std::sync::OnceLock;

/// Instruction-set width selected for the distance kernels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SimdLevel {
    Avx512,
    Avx2,
    Sse41,
    Neon,
    Scalar,
}

impl std::fmt::Display for SimdLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SimdLevel::Avx512 => "AVX-512F",
            SimdLevel::Avx2 => "AVX2",
            SimdLevel::Sse41 => "SSE4.1",
            SimdLevel::Neon => "NEON",
            SimdLevel::Scalar => "scalar",
        };
        write!(f, "{name}")
    }
}

static ACTIVE_LEVEL: OnceLock<SimdLevel> = OnceLock::new();

/// The dispatch choice for this process. Resolved once, honoring
/// `FLATGRAPH_SIMD` when it names a level the host supports.
pub fn active_level() -> SimdLevel {
    *ACTIVE_LEVEL.get_or_init(|| {
        let detected = detect_level();
        match std::env::var("FLATGRAPH_SIMD") {
            Ok(requested) => {
                let forced = match requested.to_ascii_lowercase().as_str() {
                    "avx512" => Some(SimdLevel::Avx512),
                    "avx2" => Some(SimdLevel::Avx2),
                    "sse" | "sse41" => Some(SimdLevel::Sse41),
                    "neon" => Some(SimdLevel::Neon),
                    "scalar" => Some(SimdLevel::Scalar),
                    _ => None,
                };
                match forced {
                    Some(level) if supported(level) => level,
                    Some(level) => {
                        tracing::warn!(
                            requested = %level,
                            detected = %detected,
                            "FLATGRAPH_SIMD level unavailable on this host"
                        );
                        detected
                    }
                    None => {
                        tracing::warn!(%requested, "unrecognized FLATGRAPH_SIMD value");
                        detected
                    }
                }
            }
            Err(_) => detected,
        }
    })
}

fn detect_level() -> SimdLevel {
    #[cfg(target_arch = "x86_64")]
    {
        if is_x86_feature_detected!("avx512f") {
            return SimdLevel::Avx512;
        }
        if is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma") {
            return SimdLevel::Avx2;
        }
        if is_x86_feature_detected!("sse4.1") {
            return SimdLevel::Sse41;
        }
    }
    #[cfg(target_arch = "aarch64")]
    {
        return SimdLevel::Neon;
    }
    #[allow(unreachable_code)]
    SimdLevel::Scalar
}

fn supported(level: SimdLevel) -> bool {
    match level {
        SimdLevel::Scalar => true,
        #[cfg(target_arch = "x86_64")]
        SimdLevel::Avx512 => is_x86_feature_detected!("avx512f"),
        #[cfg(target_arch = "x86_64")]
        SimdLevel::Avx2 => is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma"),
        #[cfg(target_arch = "x86_64")]
        SimdLevel::Sse41 => is_x86_feature_detected!("sse4.1"),
        #[cfg(target_arch = "aarch64")]
        SimdLevel::Neon => true,
        #[allow(unreachable_patterns)]
        _ => false,
    }
}

/// Squared Euclidean distance at the dispatched width.
#[inline]
pub fn l2_squared(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    match active_level() {
        #[cfg(target_arch = "x86_64")]
        SimdLevel::Avx512 => unsafe { x86::l2_squared_avx512(a, b) },
        #[cfg(target_arch = "x86_64")]
        SimdLevel::Avx2 => unsafe { x86::l2_squared_avx2(a, b) },
        #[cfg(target_arch = "x86_64")]
        SimdLevel::Sse41 => unsafe { x86::l2_squared_sse41(a, b) },
        #[cfg(target_arch = "aarch64")]
        SimdLevel::Neon => neon::l2_squared_neon(a, b),
        _ => l2_squared_scalar(a, b),
    }
}

/// Inner product at the dispatched width.
#[inline]
pub fn dot_product(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    match active_level() {
        #[cfg(target_arch = "x86_64")]
        SimdLevel::Avx512 => unsafe { x86::dot_product_avx512(a, b) },
        #[cfg(target_arch = "x86_64")]
        SimdLevel::Avx2 => unsafe { x86::dot_product_avx2(a, b) },
        #[cfg(target_arch = "x86_64")]
        SimdLevel::Sse41 => unsafe { x86::dot_product_sse41(a, b) },
        #[cfg(target_arch = "aarch64")]
        SimdLevel::Neon => neon::dot_product_neon(a, b),
        _ => dot_product_scalar(a, b),
    }
}

// =============================================================================
// Portable scalar implementations
// =============================================================================

#[inline]
pub(crate) fn l2_squared_scalar(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

#[inline]
pub(crate) fn dot_product_scalar(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

// =============================================================================
// x86_64 implementations
// =============================================================================

#[cfg(target_arch = "x86_64")]
mod x86 {
    use std::arch::x86_64::*;

    /// L2 squared, 16 floats per block with one 512-bit accumulator.
    #[target_feature(enable = "avx512f")]
    pub unsafe fn l2_squared_avx512(a: &[f32], b: &[f32]) -> f32 {
        let n = a.len();
        let mut sum = _mm512_setzero_ps();
        let mut i = 0;

        while i + 16 <= n {
            let va = _mm512_loadu_ps(a.as_ptr().add(i));
            let vb = _mm512_loadu_ps(b.as_ptr().add(i));
            let diff = _mm512_sub_ps(va, vb);
            sum = _mm512_fmadd_ps(diff, diff, sum);
            i += 16;
        }

        let mut result = _mm512_reduce_add_ps(sum);
        while i < n {
            let d = a[i] - b[i];
            result += d * d;
            i += 1;
        }
        result
    }

    /// Inner product, 16 floats per block with one 512-bit accumulator.
    #[target_feature(enable = "avx512f")]
    pub unsafe fn dot_product_avx512(a: &[f32], b: &[f32]) -> f32 {
        let n = a.len();
        let mut sum = _mm512_setzero_ps();
        let mut i = 0;

        while i + 16 <= n {
            let va = _mm512_loadu_ps(a.as_ptr().add(i));
            let vb = _mm512_loadu_ps(b.as_ptr().add(i));
            sum = _mm512_fmadd_ps(va, vb, sum);
            i += 16;
        }

        let mut result = _mm512_reduce_add_ps(sum);
        while i < n {
            result += a[i] * b[i];
            i += 1;
        }
        result
    }

    /// Horizontal sum of a 256-bit register.
    #[inline]
    #[target_feature(enable = "avx2")]
    unsafe fn hsum256(v: __m256) -> f32 {
        let high = _mm256_extractf128_ps(v, 1);
        let low = _mm256_castps256_ps128(v);
        let sum128 = _mm_add_ps(high, low);
        let shuf = _mm_movehdup_ps(sum128);
        let sums = _mm_add_ps(sum128, shuf);
        let shuf2 = _mm_movehl_ps(sums, sums);
        _mm_cvtss_f32(_mm_add_ss(sums, shuf2))
    }

    /// Horizontal sum of a 128-bit register.
    #[inline]
    #[target_feature(enable = "sse4.1")]
    unsafe fn hsum128(v: __m128) -> f32 {
        let shuf = _mm_movehdup_ps(v);
        let sums = _mm_add_ps(v, shuf);
        let shuf2 = _mm_movehl_ps(sums, sums);
        _mm_cvtss_f32(_mm_add_ss(sums, shuf2))
    }

    /// L2 squared, 16 floats per block as two 256-bit accumulators.
    #[target_feature(enable = "avx2,fma")]
    pub unsafe fn l2_squared_avx2(a: &[f32], b: &[f32]) -> f32 {
        let n = a.len();
        let mut sum0 = _mm256_setzero_ps();
        let mut sum1 = _mm256_setzero_ps();
        let mut i = 0;

        while i + 16 <= n {
            let va0 = _mm256_loadu_ps(a.as_ptr().add(i));
            let vb0 = _mm256_loadu_ps(b.as_ptr().add(i));
            let d0 = _mm256_sub_ps(va0, vb0);
            sum0 = _mm256_fmadd_ps(d0, d0, sum0);

            let va1 = _mm256_loadu_ps(a.as_ptr().add(i + 8));
            let vb1 = _mm256_loadu_ps(b.as_ptr().add(i + 8));
            let d1 = _mm256_sub_ps(va1, vb1);
            sum1 = _mm256_fmadd_ps(d1, d1, sum1);
            i += 16;
        }

        let mut result = hsum256(_mm256_add_ps(sum0, sum1));
        while i < n {
            let d = a[i] - b[i];
            result += d * d;
            i += 1;
        }
        result
    }

    /// Inner product, 16 floats per block as two 256-bit accumulators.
    #[target_feature(enable = "avx2,fma")]
    pub unsafe fn dot_product_avx2(a: &[f32], b: &[f32]) -> f32 {
        let n = a.len();
        let mut sum0 = _mm256_setzero_ps();
        let mut sum1 = _mm256_setzero_ps();
        let mut i = 0;

        while i + 16 <= n {
            let va0 = _mm256_loadu_ps(a.as_ptr().add(i));
            let vb0 = _mm256_loadu_ps(b.as_ptr().add(i));
            sum0 = _mm256_fmadd_ps(va0, vb0, sum0);

            let va1 = _mm256_loadu_ps(a.as_ptr().add(i + 8));
            let vb1 = _mm256_loadu_ps(b.as_ptr().add(i + 8));
            sum1 = _mm256_fmadd_ps(va1, vb1, sum1);
            i += 16;
        }

        let mut result = hsum256(_mm256_add_ps(sum0, sum1));
        while i < n {
            result += a[i] * b[i];
            i += 1;
        }
        result
    }

    /// L2 squared, 16 floats per block as four 128-bit steps.
    #[target_feature(enable = "sse4.1")]
    pub unsafe fn l2_squared_sse41(a: &[f32], b: &[f32]) -> f32 {
        let n = a.len();
        let mut sum = _mm_setzero_ps();
        let mut i = 0;

        while i + 16 <= n {
            for lane in 0..4 {
                let va = _mm_loadu_ps(a.as_ptr().add(i + lane * 4));
                let vb = _mm_loadu_ps(b.as_ptr().add(i + lane * 4));
                let diff = _mm_sub_ps(va, vb);
                sum = _mm_add_ps(sum, _mm_mul_ps(diff, diff));
            }
            i += 16;
        }

        let mut result = hsum128(sum);
        while i < n {
            let d = a[i] - b[i];
            result += d * d;
            i += 1;
        }
        result
    }

    /// Inner product, 16 floats per block as four 128-bit steps.
    #[target_feature(enable = "sse4.1")]
    pub unsafe fn dot_product_sse41(a: &[f32], b: &[f32]) -> f32 {
        let n = a.len();
        let mut sum = _mm_setzero_ps();
        let mut i = 0;

        while i + 16 <= n {
            for lane in 0..4 {
                let va = _mm_loadu_ps(a.as_ptr().add(i + lane * 4));
                let vb = _mm_loadu_ps(b.as_ptr().add(i + lane * 4));
                sum = _mm_add_ps(sum, _mm_mul_ps(va, vb));
            }
            i += 16;
        }

        let mut result = hsum128(sum);
        while i < n {
            result += a[i] * b[i];
            i += 1;
        }
        result
    }
}

// =============================================================================
// aarch64 NEON implementations
// =============================================================================

#[cfg(target_arch = "aarch64")]
mod neon {
    use std::arch::aarch64::*;

    /// L2 squared, 16 floats per block as four 128-bit steps.
    #[inline]
    pub fn l2_squared_neon(a: &[f32], b: &[f32]) -> f32 {
        let n = a.len();
        // SAFETY: NEON is always available on aarch64.
        unsafe {
            let mut sum = vdupq_n_f32(0.0);
            let mut i = 0;

            while i + 16 <= n {
                for lane in 0..4 {
                    let va = vld1q_f32(a.as_ptr().add(i + lane * 4));
                    let vb = vld1q_f32(b.as_ptr().add(i + lane * 4));
                    let diff = vsubq_f32(va, vb);
                    sum = vfmaq_f32(sum, diff, diff);
                }
                i += 16;
            }

            let mut result = vaddvq_f32(sum);
            while i < n {
                let d = a[i] - b[i];
                result += d * d;
                i += 1;
            }
            result
        }
    }

    /// Inner product, 16 floats per block as four 128-bit steps.
    #[inline]
    pub fn dot_product_neon(a: &[f32], b: &[f32]) -> f32 {
        let n = a.len();
        // SAFETY: NEON is always available on aarch64.
        unsafe {
            let mut sum = vdupq_n_f32(0.0);
            let mut i = 0;

            while i + 16 <= n {
                for lane in 0..4 {
                    let va = vld1q_f32(a.as_ptr().add(i + lane * 4));
                    let vb = vld1q_f32(b.as_ptr().add(i + lane * 4));
                    sum = vfmaq_f32(sum, va, vb);
                }
                i += 16;
            }

            let mut result = vaddvq_f32(sum);
            while i < n {
                result += a[i] * b[i];
                i += 1;
            }
            result
        }
    }
}
