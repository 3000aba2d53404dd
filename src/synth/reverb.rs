// Reverb - Convolution reverb with synthesised impulse responses
//
// Architecture:
// - ReverbProfile: named descriptor (decay, wet, damping, pre-delay)
// - ReverbNode: one profile's impulse response, generated once and shared
//   read-only (Arc) by every note that sends to it
// - ConvolutionKernel: FFT plans and partition spectra of that response,
//   computed with the node and shared by every convolver built from it
// - Convolver: uniformly partitioned overlap-add FFT convolution. Each mix
//   bus owns one; the node itself is never mutated after creation.
//
// Real-time constraints:
// - Planning and partition transforms happen once, in ReverbNode::new
// - Convolver::new only allocates the delay line and scratch space
// - Blocks of silence longer than the impulse response skip the FFT work

use rand::Rng;
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Profile used for unknown ids
pub const DEFAULT_PROFILE: &str = "default";

/// Convolution block size in frames (latency of the wet path)
pub const CONVOLUTION_BLOCK: usize = 512;

/// Named impulse-response descriptor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReverbProfile {
    pub id: String,
    /// Time for the tail to fall by 60 dB, in seconds
    pub decay: f32,
    /// Wet send gain applied on top of the per-note reverb mix
    pub wet: f32,
    /// High-frequency damping over the tail (0.0 - 1.0)
    pub damping: f32,
    /// Silence before the tail, in milliseconds
    #[serde(default)]
    pub pre_delay_ms: f32,
}

impl ReverbProfile {
    pub fn new(id: impl Into<String>, decay: f32, wet: f32, damping: f32) -> Self {
        Self {
            id: id.into(),
            decay: decay.clamp(0.1, 10.0),
            wet: wet.clamp(0.0, 1.0),
            damping: damping.clamp(0.0, 1.0),
            pre_delay_ms: 0.0,
        }
    }

    fn with_pre_delay(mut self, ms: f32) -> Self {
        self.pre_delay_ms = ms.clamp(0.0, 200.0);
        self
    }

    pub fn hall() -> Self {
        Self::new("hall", 3.2, 0.4, 0.35).with_pre_delay(25.0)
    }

    pub fn room() -> Self {
        Self::new("room", 1.1, 0.3, 0.55).with_pre_delay(8.0)
    }

    pub fn plate() -> Self {
        Self::new("plate", 2.2, 0.35, 0.15)
    }

    pub fn default_profile() -> Self {
        Self::new(DEFAULT_PROFILE, 1.8, 0.3, 0.45).with_pre_delay(12.0)
    }

    /// Built-in profile for `id`, if one exists
    pub fn builtin(id: &str) -> Option<Self> {
        match id {
            "hall" => Some(Self::hall()),
            "room" => Some(Self::room()),
            "plate" => Some(Self::plate()),
            DEFAULT_PROFILE => Some(Self::default_profile()),
            _ => None,
        }
    }

    /// Built-in profile for `id`, falling back to the default profile
    pub fn resolve(id: &str) -> Self {
        Self::builtin(id).unwrap_or_else(Self::default_profile)
    }

    /// Synthesise an impulse response: exponentially decaying noise run
    /// through a lowpass that closes as the tail ages, normalised to unit
    /// energy. `length_scale` shortens the tail for cheaper quality tiers.
    pub fn generate_impulse_response(&self, sample_rate: f32, length_scale: f32) -> Vec<f32> {
        let tail_len = ((self.decay * length_scale.clamp(0.1, 1.0)) * sample_rate).max(64.0) as usize;
        let pre_delay = (self.pre_delay_ms * 0.001 * sample_rate) as usize;
        let mut ir = vec![0.0f32; pre_delay + tail_len];

        let mut rng = rand::thread_rng();
        let decay_samples = self.decay * sample_rate;
        let mut lowpass = 0.0f32;

        for (i, slot) in ir[pre_delay..].iter_mut().enumerate() {
            let age = i as f32 / decay_samples;
            // -60 dB at `decay`
            let envelope = (-6.908 * age).exp();
            let openness = 1.0 - self.damping * age.min(1.0) * 0.95;
            let noise: f32 = rng.gen_range(-1.0..1.0);
            lowpass += openness * (noise - lowpass);
            *slot = lowpass * envelope;
        }

        let energy: f32 = ir.iter().map(|x| x * x).sum::<f32>().sqrt();
        if energy > 0.0 {
            for x in ir.iter_mut() {
                *x /= energy;
            }
        }
        ir
    }
}

impl Default for ReverbProfile {
    fn default() -> Self {
        Self::default_profile()
    }
}

/// A profile's impulse response, shared read-only by every note using it
#[derive(Debug)]
pub struct ReverbNode {
    profile: ReverbProfile,
    impulse: Vec<f32>,
    kernel: Arc<ConvolutionKernel>,
    sample_rate: f32,
}

impl ReverbNode {
    pub fn new(profile: ReverbProfile, sample_rate: f32, length_scale: f32) -> Self {
        let impulse = profile.generate_impulse_response(sample_rate, length_scale);
        let kernel = Arc::new(ConvolutionKernel::new(&impulse, CONVOLUTION_BLOCK));
        Self {
            profile,
            impulse,
            kernel,
            sample_rate,
        }
    }

    pub fn id(&self) -> &str {
        &self.profile.id
    }

    pub fn profile(&self) -> &ReverbProfile {
        &self.profile
    }

    pub fn impulse(&self) -> &[f32] {
        &self.impulse
    }

    pub fn kernel(&self) -> &Arc<ConvolutionKernel> {
        &self.kernel
    }

    pub fn duration_secs(&self) -> f32 {
        self.impulse.len() as f32 / self.sample_rate
    }

    /// Approximate heap size of the impulse response and its spectra
    pub fn memory_bytes(&self) -> usize {
        self.impulse.len() * std::mem::size_of::<f32>() + self.kernel.memory_bytes()
    }

    /// Fresh convolution state for a mix bus
    pub fn convolver(&self) -> Convolver {
        Convolver::new(Arc::clone(&self.kernel))
    }
}

/// Read-only half of a partitioned convolution
pub struct ConvolutionKernel {
    block_size: usize,
    fft: Arc<dyn Fft<f32>>,
    ifft: Arc<dyn Fft<f32>>,
    /// Spectra of the impulse-response partitions
    partitions: Vec<Vec<Complex<f32>>>,
}

impl std::fmt::Debug for ConvolutionKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConvolutionKernel")
            .field("block_size", &self.block_size)
            .field("partitions", &self.partitions.len())
            .finish()
    }
}

impl ConvolutionKernel {
    pub fn new(impulse: &[f32], block_size: usize) -> Self {
        let block_size = block_size.max(16);
        let fft_size = block_size * 2;
        let mut planner = FftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(fft_size);
        let ifft = planner.plan_fft_inverse(fft_size);
        let mut scratch = vec![Complex::default(); fft.get_inplace_scratch_len()];

        let partition_count = impulse.len().div_ceil(block_size).max(1);
        let mut partitions = Vec::with_capacity(partition_count);
        for chunk_index in 0..partition_count {
            let mut spectrum = vec![Complex::default(); fft_size];
            let start = (chunk_index * block_size).min(impulse.len());
            let end = (start + block_size).min(impulse.len());
            for (slot, &h) in spectrum.iter_mut().zip(impulse[start..end].iter()) {
                slot.re = h;
            }
            fft.process_with_scratch(&mut spectrum, &mut scratch);
            partitions.push(spectrum);
        }

        Self {
            block_size,
            fft,
            ifft,
            partitions,
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    fn scratch_len(&self) -> usize {
        self.fft
            .get_inplace_scratch_len()
            .max(self.ifft.get_inplace_scratch_len())
    }

    pub fn memory_bytes(&self) -> usize {
        self.partitions.len() * self.block_size * 2 * std::mem::size_of::<Complex<f32>>()
    }
}

/// Uniformly partitioned overlap-add convolution
///
/// Input is buffered into blocks of `block_size`; output lags input by one
/// block. Each block costs one forward FFT, one inverse FFT and one complex
/// multiply-accumulate per impulse-response partition.
pub struct Convolver {
    block_size: usize,
    kernel: Arc<ConvolutionKernel>,
    scratch: Vec<Complex<f32>>,

    /// Frequency-domain delay line of past input blocks (ring)
    history: Vec<Vec<Complex<f32>>>,
    history_head: usize,

    work: Vec<Complex<f32>>,
    accumulator: Vec<Complex<f32>>,
    overlap: Vec<f32>,

    input_block: Vec<f32>,
    output_block: Vec<f32>,
    position: usize,
    silent_blocks: usize,
}

impl Convolver {
    pub fn new(kernel: Arc<ConvolutionKernel>) -> Self {
        let block_size = kernel.block_size;
        let fft_size = block_size * 2;
        let partition_count = kernel.partitions.len();

        Self {
            block_size,
            scratch: vec![Complex::default(); kernel.scratch_len()],
            history: vec![vec![Complex::default(); fft_size]; partition_count],
            kernel,
            history_head: 0,
            work: vec![Complex::default(); fft_size],
            accumulator: vec![Complex::default(); fft_size],
            overlap: vec![0.0; block_size],
            input_block: vec![0.0; block_size],
            output_block: vec![0.0; block_size],
            position: 0,
            silent_blocks: usize::MAX / 2,
        }
    }

    /// Plan and transform `impulse` for a one-off convolver
    pub fn from_impulse(impulse: &[f32], block_size: usize) -> Self {
        Self::new(Arc::new(ConvolutionKernel::new(impulse, block_size)))
    }

    pub fn kernel(&self) -> &Arc<ConvolutionKernel> {
        &self.kernel
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn partition_count(&self) -> usize {
        self.kernel.partitions.len()
    }

    /// True once every trace of past input has left the output
    pub fn is_idle(&self) -> bool {
        self.silent_blocks > self.kernel.partitions.len()
    }

    /// Convolve `input` into `output` (same length, any size)
    pub fn process(&mut self, input: &[f32], output: &mut [f32]) {
        for (x, y) in input.iter().zip(output.iter_mut()) {
            self.input_block[self.position] = *x;
            *y = self.output_block[self.position];
            self.position += 1;
            if self.position == self.block_size {
                self.position = 0;
                self.process_block();
            }
        }
    }

    fn process_block(&mut self) {
        let input_silent = self.input_block.iter().all(|x| *x == 0.0);
        if input_silent {
            self.silent_blocks = self.silent_blocks.saturating_add(1);
        } else {
            self.silent_blocks = 0;
        }

        if self.is_idle() {
            self.output_block.fill(0.0);
            return;
        }

        let kernel = &self.kernel;
        let partition_count = kernel.partitions.len();
        let fft_size = self.block_size * 2;
        let scale = 1.0 / fft_size as f32;

        // Newest input spectrum goes into the delay line
        self.history_head = (self.history_head + partition_count - 1) % partition_count;
        let slot = &mut self.history[self.history_head];
        for (i, bin) in slot.iter_mut().enumerate() {
            *bin = Complex::new(if i < self.block_size { self.input_block[i] } else { 0.0 }, 0.0);
        }
        kernel.fft.process_with_scratch(slot, &mut self.scratch);

        self.accumulator.fill(Complex::default());
        for (p, partition) in kernel.partitions.iter().enumerate() {
            let delayed = &self.history[(self.history_head + p) % partition_count];
            for ((acc, x), h) in self.accumulator.iter_mut().zip(delayed).zip(partition) {
                *acc += x * h;
            }
        }

        self.work.copy_from_slice(&self.accumulator);
        kernel.ifft.process_with_scratch(&mut self.work, &mut self.scratch);

        for i in 0..self.block_size {
            self.output_block[i] = self.work[i].re * scale + self.overlap[i];
            self.overlap[i] = self.work[i + self.block_size].re * scale;
        }
    }

    pub fn reset(&mut self) {
        for spectrum in self.history.iter_mut() {
            spectrum.fill(Complex::default());
        }
        self.overlap.fill(0.0);
        self.input_block.fill(0.0);
        self.output_block.fill(0.0);
        self.position = 0;
        self.silent_blocks = usize::MAX / 2;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_RATE: f32 = 48000.0;

    fn direct_convolution(input: &[f32], ir: &[f32], len: usize) -> Vec<f32> {
        let mut out = vec![0.0; len];
        for (n, y) in out.iter_mut().enumerate() {
            for (k, h) in ir.iter().enumerate() {
                if k <= n && n - k < input.len() {
                    *y += input[n - k] * h;
                }
            }
        }
        out
    }

    #[test]
    fn test_builtin_profiles_and_fallback() {
        for id in ["hall", "room", "plate", "default"] {
            let profile = ReverbProfile::builtin(id).unwrap();
            assert_eq!(profile.id, id);
        }
        assert!(ReverbProfile::builtin("cathedral").is_none());
        assert_eq!(ReverbProfile::resolve("cathedral").id, DEFAULT_PROFILE);
        assert!(ReverbProfile::hall().decay > ReverbProfile::room().decay);
    }

    #[test]
    fn test_impulse_response_shape() {
        let profile = ReverbProfile::room();
        let ir = profile.generate_impulse_response(SAMPLE_RATE, 1.0);
        let pre_delay = (profile.pre_delay_ms * 0.001 * SAMPLE_RATE) as usize;

        assert!(ir[..pre_delay].iter().all(|x| *x == 0.0));
        let energy: f32 = ir.iter().map(|x| x * x).sum();
        assert!((energy - 1.0).abs() < 1e-3);

        // Tail decays: the first quarter holds far more energy than the last
        let quarter = ir.len() / 4;
        let head: f32 = ir[..quarter].iter().map(|x| x * x).sum();
        let tail: f32 = ir[ir.len() - quarter..].iter().map(|x| x * x).sum();
        assert!(head > tail * 100.0);
    }

    #[test]
    fn test_length_scale_shortens_tail() {
        let profile = ReverbProfile::hall();
        let full = profile.generate_impulse_response(SAMPLE_RATE, 1.0);
        let half = profile.generate_impulse_response(SAMPLE_RATE, 0.5);
        assert!(half.len() < full.len());
    }

    #[test]
    fn test_responses_differ_but_stay_consistent() {
        let profile = ReverbProfile::plate();
        let a = profile.generate_impulse_response(SAMPLE_RATE, 1.0);
        let b = profile.generate_impulse_response(SAMPLE_RATE, 1.0);
        assert_eq!(a.len(), b.len());
        assert_ne!(a, b);
    }

    #[test]
    fn test_convolver_matches_direct_convolution() {
        let ir: Vec<f32> = (0..100).map(|i| ((i as f32) * 0.37).sin() / (1.0 + i as f32)).collect();
        let input: Vec<f32> = (0..200).map(|i| ((i as f32) * 0.11).cos()).collect();
        let block = 32;
        let total = 400;

        let mut convolver = Convolver::from_impulse(&ir, block);
        assert_eq!(convolver.partition_count(), 4);

        let mut padded = input.clone();
        padded.resize(total, 0.0);
        let mut output = vec![0.0; total];
        convolver.process(&padded, &mut output);

        let expected = direct_convolution(&input, &ir, total - block);
        for n in 0..total - block {
            // One block of latency
            assert!(
                (output[n + block] - expected[n]).abs() < 1e-3,
                "sample {} got {} expected {}",
                n,
                output[n + block],
                expected[n]
            );
        }
    }

    #[test]
    fn test_convolver_goes_idle_after_tail() {
        let ir = vec![0.5; 64];
        let mut convolver = Convolver::from_impulse(&ir, 16);
        assert!(convolver.is_idle());

        let mut out = vec![0.0; 16];
        convolver.process(&[1.0; 16], &mut out);
        assert!(!convolver.is_idle());

        let silence = vec![0.0; 16 * 8];
        let mut out = vec![0.0; 16 * 8];
        convolver.process(&silence, &mut out);
        assert!(convolver.is_idle());

        let mut out = vec![1.0; 16];
        convolver.process(&[0.0; 16], &mut out);
        assert!(out.iter().all(|x| *x == 0.0));
    }

    #[test]
    fn test_node_metadata() {
        let node = ReverbNode::new(ReverbProfile::plate(), SAMPLE_RATE, 1.0);
        assert_eq!(node.id(), "plate");
        assert!((node.duration_secs() - 2.2).abs() < 0.01);
        let spectra = node.kernel().partition_count() * CONVOLUTION_BLOCK * 2 * 8;
        assert_eq!(node.memory_bytes(), node.impulse().len() * 4 + spectra);
        assert_eq!(node.convolver().block_size(), CONVOLUTION_BLOCK);
    }

    #[test]
    fn test_convolvers_share_the_node_kernel() {
        let node = ReverbNode::new(ReverbProfile::room(), SAMPLE_RATE, 0.2);
        let mut a = node.convolver();
        let mut b = node.convolver();
        assert!(Arc::ptr_eq(a.kernel(), b.kernel()));
        assert!(Arc::ptr_eq(a.kernel(), node.kernel()));
        assert_eq!(Arc::strong_count(node.kernel()), 3);

        // Shared spectra, independent state
        let input: Vec<f32> = (0..CONVOLUTION_BLOCK * 4).map(|i| ((i as f32) * 0.05).sin()).collect();
        let mut out_a = vec![0.0; input.len()];
        let mut out_b = vec![0.0; input.len()];
        a.process(&input, &mut out_a);
        b.process(&input, &mut out_b);
        assert_eq!(out_a, out_b);
        assert!(out_a.iter().any(|x| *x != 0.0));

        let mut quiet = vec![1.0; CONVOLUTION_BLOCK];
        node.convolver().process(&vec![0.0; CONVOLUTION_BLOCK], &mut quiet);
        assert!(quiet.iter().all(|x| *x == 0.0));
    }

    #[test]
    fn test_kernel_matches_one_off_convolver() {
        let ir: Vec<f32> = (0..300).map(|i| (-(i as f32) / 60.0).exp() * ((i as f32) * 0.9).sin()).collect();
        let input: Vec<f32> = (0..512).map(|i| ((i as f32) * 0.21).cos()).collect();
        let kernel = Arc::new(ConvolutionKernel::new(&ir, 64));
        assert_eq!(kernel.partition_count(), 5);

        let mut shared = Convolver::new(Arc::clone(&kernel));
        let mut one_off = Convolver::from_impulse(&ir, 64);
        let mut out_shared = vec![0.0; input.len()];
        let mut out_one_off = vec![0.0; input.len()];
        shared.process(&input, &mut out_shared);
        one_off.process(&input, &mut out_one_off);
        for (x, y) in out_shared.iter().zip(&out_one_off) {
            assert!((x - y).abs() < 1e-6);
        }
    }
}
