//! Software H.264 encoder
//!
//! Lossless fallback that needs no vendor SDK. Changed frames are coded as
//! I_PCM macroblocks (raw 4:2:0 samples inside a valid constrained baseline
//! bitstream); unchanged frames become a P slice of skipped macroblocks.
//! Bitrate settings are accepted but have no effect on the output size.
//!
//! ```text
//! force/first ──> SPS + PPS + IDR (I_PCM)
//! changed     ──> non-IDR I slice (I_PCM)
//! unchanged   ──> P slice, mb_skip_run = all
//! ```

use bytes::Bytes;
use tracing::{debug, info};

use super::bitstream::{write_nal, BitWriter, NalType};
use super::traits::{
    EncodeOptions, EncodedPacket, EncoderCodec, LayerConfig, VideoEncoder,
};
use crate::error::{AppError, Result};
use crate::video::format::{PixelFormat, Resolution};
use crate::video::input::{InputFrame, InputPool, NativeBuffer};

/// frame_num is coded in log2_max_frame_num = 4 bits
const MAX_FRAME_NUM: u32 = 16;
/// Slice QP reported for I_PCM frames
const PCM_QP: u32 = 26;

/// I_PCM mb_type in an I slice
const MB_TYPE_I_PCM: u32 = 25;

struct LayerState {
    config: LayerConfig,
    needs_reconfigure: bool,
    /// Set after the first IDR of the current configuration
    started: bool,
    frame_num: u32,
    idr_pic_id: u32,
    last_hash: Option<u64>,
}

impl LayerState {
    fn new(config: LayerConfig) -> Self {
        Self {
            config,
            needs_reconfigure: true,
            started: false,
            frame_num: 0,
            idr_pic_id: 0,
            last_hash: None,
        }
    }

    fn reconfigure(&mut self) {
        debug!(
            "Reconfiguring software encoder layer to {}x{}",
            self.config.width, self.config.height
        );
        self.started = false;
        self.last_hash = None;
        self.needs_reconfigure = false;
    }
}

/// Software H.264 encoder (I_PCM / P-skip)
pub struct SoftwareH264Encoder {
    input: Option<InputPool>,
    layers: Vec<LayerState>,
}

impl SoftwareH264Encoder {
    pub const NAME: &'static str = "software-h264";

    pub fn new() -> Self {
        Self {
            input: None,
            layers: Vec::new(),
        }
    }

    fn encode_layer(
        layer: &mut LayerState,
        index: u32,
        host: &crate::video::input::HostBuffer,
        frame: &InputFrame,
        options: EncodeOptions,
    ) -> EncodedPacket {
        let resolution = layer.config.resolution();
        let hash = xxhash_rust::xxh64::xxh64(&host.data, index as u64);

        let key_frame = options.force_key_frame || !layer.started;
        let changed = layer.last_hash != Some(hash);
        let mut out = Vec::new();

        if key_frame {
            write_nal(&mut out, 3, NalType::Sps, &sps_rbsp(resolution));
            write_nal(&mut out, 3, NalType::Pps, &pps_rbsp());
            layer.frame_num = 0;
            let yuv = to_yuv420(host, resolution);
            let slice = pcm_slice_rbsp(&yuv, resolution, true, 0, layer.idr_pic_id);
            write_nal(&mut out, 3, NalType::IdrSlice, &slice);
            layer.idr_pic_id = (layer.idr_pic_id + 1) % 2;
            layer.started = true;
        } else {
            layer.frame_num = (layer.frame_num + 1) % MAX_FRAME_NUM;
            if changed {
                let yuv = to_yuv420(host, resolution);
                let slice = pcm_slice_rbsp(&yuv, resolution, false, layer.frame_num, 0);
                write_nal(&mut out, 3, NalType::Slice, &slice);
            } else {
                let slice = skip_slice_rbsp(resolution, layer.frame_num);
                write_nal(&mut out, 3, NalType::Slice, &slice);
            }
        }
        layer.last_hash = Some(hash);

        EncodedPacket {
            data: Bytes::from(out),
            layer: index,
            frame_id: frame.frame_id(),
            timestamp_us: frame.timestamp_us(),
            key_frame,
            qp: PCM_QP,
        }
    }
}

impl Default for SoftwareH264Encoder {
    fn default() -> Self {
        Self::new()
    }
}

impl VideoEncoder for SoftwareH264Encoder {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn codec(&self) -> EncoderCodec {
        EncoderCodec::H264
    }

    fn setup(&mut self, input: InputPool, layer: LayerConfig) -> Result<()> {
        if input.format() != PixelFormat::Bgra8 && input.format() != PixelFormat::Rgba8 {
            return Err(AppError::Encoder(format!(
                "unsupported input format {}",
                input.format()
            )));
        }
        if layer.width == 0 || layer.height == 0 || layer.width % 2 != 0 || layer.height % 2 != 0 {
            return Err(AppError::Encoder(format!(
                "invalid layer size {}x{} (4:2:0 needs even dimensions)",
                layer.width, layer.height
            )));
        }
        info!(
            "{} setup: {}x{} @ {} fps, {:?}",
            Self::NAME,
            layer.width,
            layer.height,
            layer.max_framerate,
            layer.rate_control
        );
        self.input = Some(input);
        self.layers = vec![LayerState::new(layer)];
        Ok(())
    }

    fn add_layer(&mut self, layer: LayerConfig) -> Result<u32> {
        if self.input.is_none() {
            return Err(AppError::Encoder("add_layer before setup".to_string()));
        }
        self.layers.push(LayerState::new(layer));
        Ok(self.layers.len() as u32 - 1)
    }

    fn layer_count(&self) -> u32 {
        self.layers.len() as u32
    }

    fn layer_config(&self, layer: u32) -> Option<LayerConfig> {
        self.layers.get(layer as usize).map(|l| l.config)
    }

    fn update_layer_config(&mut self, layer: u32, config: LayerConfig) -> Result<()> {
        let state = self
            .layers
            .get_mut(layer as usize)
            .ok_or_else(|| AppError::Encoder(format!("no layer {}", layer)))?;
        if state.config != config {
            state.config = config;
            state.needs_reconfigure = true;
        }
        Ok(())
    }

    fn encode(&mut self, frame: &InputFrame, options: EncodeOptions) -> Result<Vec<EncodedPacket>> {
        if self.input.is_none() {
            return Err(AppError::Encoder("encode before setup".to_string()));
        }
        let frame_resolution = frame.resolution();

        let layers = &mut self.layers;
        let packets = frame.read(|buffer| -> Result<Vec<EncodedPacket>> {
            let host = match buffer {
                NativeBuffer::Host(host) => host,
                NativeBuffer::External { .. } => {
                    return Err(AppError::Encoder(
                        "software encoder needs host input buffers".to_string(),
                    ))
                }
            };

            let mut packets = Vec::with_capacity(layers.len());
            for (index, layer) in layers.iter_mut().enumerate() {
                // Layer 0 follows the input size
                if index == 0 && layer.config.resolution() != frame_resolution {
                    layer.config.width = frame_resolution.width;
                    layer.config.height = frame_resolution.height;
                    layer.needs_reconfigure = true;
                }
                if layer.needs_reconfigure {
                    layer.reconfigure();
                }
                packets.push(Self::encode_layer(layer, index as u32, host, frame, options));
            }
            Ok(packets)
        });

        packets.unwrap_or_else(|| Err(AppError::Encoder("input frame has no buffer".to_string())))
    }

    fn shutdown(&mut self) {
        debug!("{} shutdown", Self::NAME);
        self.layers.clear();
        self.input = None;
    }
}

fn mb_dims(resolution: Resolution) -> (u32, u32) {
    ((resolution.width + 15) / 16, (resolution.height + 15) / 16)
}

fn level_idc(resolution: Resolution) -> u8 {
    let (w, h) = mb_dims(resolution);
    match w * h {
        0..=1620 => 30,
        1621..=3600 => 31,
        3601..=8192 => 40,
        _ => 51,
    }
}

fn sps_rbsp(resolution: Resolution) -> Vec<u8> {
    let (mb_w, mb_h) = mb_dims(resolution);
    let mut w = BitWriter::new();
    w.put_bits(66, 8); // profile_idc: baseline
    w.put_bits(0xE0, 8); // constraint_set0..2
    w.put_bits(level_idc(resolution) as u32, 8);
    w.put_ue(0); // seq_parameter_set_id
    w.put_ue(0); // log2_max_frame_num_minus4
    w.put_ue(2); // pic_order_cnt_type
    w.put_ue(1); // max_num_ref_frames
    w.put_bit(false); // gaps_in_frame_num_value_allowed_flag
    w.put_ue(mb_w - 1);
    w.put_ue(mb_h - 1);
    w.put_bit(true); // frame_mbs_only_flag
    w.put_bit(true); // direct_8x8_inference_flag

    let crop_right = (mb_w * 16 - resolution.width) / 2;
    let crop_bottom = (mb_h * 16 - resolution.height) / 2;
    if crop_right > 0 || crop_bottom > 0 {
        w.put_bit(true);
        w.put_ue(0);
        w.put_ue(crop_right);
        w.put_ue(0);
        w.put_ue(crop_bottom);
    } else {
        w.put_bit(false);
    }
    w.put_bit(false); // vui_parameters_present_flag
    w.trailing_bits();
    w.into_bytes()
}

fn pps_rbsp() -> Vec<u8> {
    let mut w = BitWriter::new();
    w.put_ue(0); // pic_parameter_set_id
    w.put_ue(0); // seq_parameter_set_id
    w.put_bit(false); // entropy_coding_mode_flag: CAVLC
    w.put_bit(false); // bottom_field_pic_order_in_frame_present_flag
    w.put_ue(0); // num_slice_groups_minus1
    w.put_ue(0); // num_ref_idx_l0_default_active_minus1
    w.put_ue(0); // num_ref_idx_l1_default_active_minus1
    w.put_bit(false); // weighted_pred_flag
    w.put_bits(0, 2); // weighted_bipred_idc
    w.put_se(0); // pic_init_qp_minus26
    w.put_se(0); // pic_init_qs_minus26
    w.put_se(0); // chroma_qp_index_offset
    w.put_bit(true); // deblocking_filter_control_present_flag
    w.put_bit(false); // constrained_intra_pred_flag
    w.put_bit(false); // redundant_pic_cnt_present_flag
    w.trailing_bits();
    w.into_bytes()
}

/// Slice of I_PCM macroblocks; `idr` selects the IDR header layout
fn pcm_slice_rbsp(yuv: &Yuv420, resolution: Resolution, idr: bool, frame_num: u32, idr_pic_id: u32) -> Vec<u8> {
    let (mb_w, mb_h) = mb_dims(resolution);
    let mut w = BitWriter::with_capacity((mb_w * mb_h * 386) as usize + 16);

    w.put_ue(0); // first_mb_in_slice
    w.put_ue(7); // slice_type: I (all slices)
    w.put_ue(0); // pic_parameter_set_id
    w.put_bits(frame_num, 4);
    if idr {
        w.put_ue(idr_pic_id);
        w.put_bit(false); // no_output_of_prior_pics_flag
        w.put_bit(false); // long_term_reference_flag
    } else {
        w.put_bit(false); // adaptive_ref_pic_marking_mode_flag
    }
    w.put_se(0); // slice_qp_delta
    w.put_ue(1); // disable_deblocking_filter_idc

    let mut block = [0u8; 384];
    for mb_y in 0..mb_h as usize {
        for mb_x in 0..mb_w as usize {
            w.put_ue(MB_TYPE_I_PCM);
            w.align_zero();
            yuv.macroblock(mb_x, mb_y, &mut block);
            w.put_bytes(&block);
        }
    }
    w.trailing_bits();
    w.into_bytes()
}

/// P slice in which every macroblock is skipped
fn skip_slice_rbsp(resolution: Resolution, frame_num: u32) -> Vec<u8> {
    let (mb_w, mb_h) = mb_dims(resolution);
    let mut w = BitWriter::new();
    w.put_ue(0); // first_mb_in_slice
    w.put_ue(5); // slice_type: P (all slices)
    w.put_ue(0); // pic_parameter_set_id
    w.put_bits(frame_num, 4);
    w.put_bit(false); // num_ref_idx_active_override_flag
    w.put_bit(false); // ref_pic_list_modification_flag_l0
    w.put_bit(false); // adaptive_ref_pic_marking_mode_flag
    w.put_se(0); // slice_qp_delta
    w.put_ue(1); // disable_deblocking_filter_idc
    w.put_ue(mb_w * mb_h); // mb_skip_run
    w.trailing_bits();
    w.into_bytes()
}

/// Planar 4:2:0 picture padded to whole macroblocks
struct Yuv420 {
    luma: Vec<u8>,
    cb: Vec<u8>,
    cr: Vec<u8>,
    /// Padded luma width
    width: usize,
}

impl Yuv420 {
    fn macroblock(&self, mb_x: usize, mb_y: usize, out: &mut [u8; 384]) {
        let cw = self.width / 2;
        for row in 0..16 {
            let src = (mb_y * 16 + row) * self.width + mb_x * 16;
            out[row * 16..row * 16 + 16].copy_from_slice(&self.luma[src..src + 16]);
        }
        for row in 0..8 {
            let src = (mb_y * 8 + row) * cw + mb_x * 8;
            out[256 + row * 8..256 + row * 8 + 8].copy_from_slice(&self.cb[src..src + 8]);
            out[320 + row * 8..320 + row * 8 + 8].copy_from_slice(&self.cr[src..src + 8]);
        }
    }
}

/// BT.601 limited-range conversion. Samples the host buffer with nearest
/// neighbour when `resolution` differs from the buffer, edge-replicates into
/// the macroblock padding.
fn to_yuv420(host: &crate::video::input::HostBuffer, resolution: Resolution) -> Yuv420 {
    let (mb_w, mb_h) = mb_dims(resolution);
    let pw = mb_w as usize * 16;
    let ph = mb_h as usize * 16;
    let (sw, sh) = (host.resolution.width as usize, host.resolution.height as usize);
    let (vw, vh) = (resolution.width as usize, resolution.height as usize);
    let offsets = host.format.channel_offsets();

    let rgb_at = |x: usize, y: usize| -> (i32, i32, i32) {
        let x = x.min(vw - 1) * sw / vw;
        let y = y.min(vh - 1) * sh / vh;
        let p = (y * sw + x) * 4;
        (
            host.data[p + offsets[0]] as i32,
            host.data[p + offsets[1]] as i32,
            host.data[p + offsets[2]] as i32,
        )
    };

    let mut luma = vec![0u8; pw * ph];
    let mut cb = vec![0u8; pw * ph / 4];
    let mut cr = vec![0u8; pw * ph / 4];

    for y in 0..ph {
        for x in 0..pw {
            let (r, g, b) = rgb_at(x, y);
            luma[y * pw + x] = (((66 * r + 129 * g + 25 * b + 128) >> 8) + 16) as u8;
        }
    }
    for cy in 0..ph / 2 {
        for cx in 0..pw / 2 {
            let (mut r, mut g, mut b) = (0, 0, 0);
            for (dx, dy) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
                let (pr, pg, pb) = rgb_at(cx * 2 + dx, cy * 2 + dy);
                r += pr;
                g += pg;
                b += pb;
            }
            let (r, g, b) = (r / 4, g / 4, b / 4);
            cb[cy * (pw / 2) + cx] = (((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128) as u8;
            cr[cy * (pw / 2) + cx] = (((112 * r - 94 * g - 18 * b + 128) >> 8) + 128) as u8;
        }
    }

    Yuv420 {
        luma,
        cb,
        cr,
        width: pw,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::encoder::bitstream::split_nal_units;
    use crate::video::frame::SourceFrame;
    use crate::video::input::{HostBackend, InputPool};

    fn setup(resolution: Resolution) -> (SoftwareH264Encoder, InputPool) {
        let pool = InputPool::with_backend(
            Box::new(HostBackend::new(PixelFormat::Bgra8)),
            resolution,
            true,
        );
        let mut encoder = SoftwareH264Encoder::new();
        encoder
            .setup(
                pool.clone(),
                LayerConfig {
                    width: resolution.width,
                    height: resolution.height,
                    max_framerate: 30,
                    ..Default::default()
                },
            )
            .unwrap();
        (encoder, pool)
    }

    fn frame(pool: &InputPool, rgba: [u8; 4]) -> InputFrame {
        let mut frame = pool.obtain_input_frame().unwrap();
        let source = SourceFrame::solid(pool.resolution(), PixelFormat::Bgra8, rgba);
        pool.copy_into(&mut frame, &source).unwrap();
        frame
    }

    fn nal_types(data: &[u8]) -> Vec<u8> {
        split_nal_units(data).iter().map(|n| n[0] & 0x1f).collect()
    }

    #[test]
    fn test_first_frame_is_idr_with_parameter_sets() {
        let (mut encoder, pool) = setup(Resolution::new(32, 32));
        let f = frame(&pool, [255, 0, 0, 255]);
        let packets = encoder.encode(&f, EncodeOptions::default()).unwrap();
        assert_eq!(packets.len(), 1);
        assert!(packets[0].key_frame);
        assert_eq!(packets[0].frame_id, f.frame_id());
        assert_eq!(nal_types(&packets[0].data), vec![7, 8, 5]);
        // 4 macroblocks of 384 samples plus headers
        assert!(packets[0].len() > 4 * 384);
    }

    #[test]
    fn test_unchanged_frame_is_skip_slice() {
        let (mut encoder, pool) = setup(Resolution::new(32, 32));
        let first = frame(&pool, [0, 255, 0, 255]);
        encoder.encode(&first, EncodeOptions::default()).unwrap();
        drop(first);

        let same = frame(&pool, [0, 255, 0, 255]);
        let packets = encoder.encode(&same, EncodeOptions::default()).unwrap();
        assert!(!packets[0].key_frame);
        assert_eq!(nal_types(&packets[0].data), vec![1]);
        assert!(packets[0].len() < 16);

        let changed = frame(&pool, [0, 0, 255, 255]);
        let packets = encoder.encode(&changed, EncodeOptions::default()).unwrap();
        assert!(!packets[0].key_frame);
        assert!(packets[0].len() > 4 * 384);
    }

    #[test]
    fn test_forced_key_frame() {
        let (mut encoder, pool) = setup(Resolution::new(16, 16));
        encoder
            .encode(&frame(&pool, [1, 1, 1, 255]), EncodeOptions::default())
            .unwrap();
        let packets = encoder
            .encode(
                &frame(&pool, [1, 1, 1, 255]),
                EncodeOptions {
                    force_key_frame: true,
                },
            )
            .unwrap();
        assert!(packets[0].key_frame);
    }

    #[test]
    fn test_config_change_forces_reconfigure() {
        let (mut encoder, pool) = setup(Resolution::new(16, 16));
        encoder
            .encode(&frame(&pool, [1, 1, 1, 255]), EncodeOptions::default())
            .unwrap();

        let mut config = encoder.layer_config(0).unwrap();
        encoder.update_layer_config(0, config).unwrap();
        let packets = encoder
            .encode(&frame(&pool, [1, 1, 1, 255]), EncodeOptions::default())
            .unwrap();
        assert!(!packets[0].key_frame, "identical config is not a reconfigure");

        config.max_bitrate = 1_000_000;
        encoder.update_layer_config(0, config).unwrap();
        let packets = encoder
            .encode(&frame(&pool, [1, 1, 1, 255]), EncodeOptions::default())
            .unwrap();
        assert!(packets[0].key_frame);
    }

    #[test]
    fn test_input_resize_reconfigures_layer_zero() {
        let (mut encoder, pool) = setup(Resolution::new(16, 16));
        encoder
            .encode(&frame(&pool, [1, 1, 1, 255]), EncodeOptions::default())
            .unwrap();

        pool.set_resolution(Resolution::new(48, 32)).unwrap();
        let packets = encoder
            .encode(&frame(&pool, [1, 1, 1, 255]), EncodeOptions::default())
            .unwrap();
        assert!(packets[0].key_frame);
        assert_eq!(
            encoder.layer_config(0).unwrap().resolution(),
            Resolution::new(48, 32)
        );
    }

    #[test]
    fn test_extra_layer_is_scaled() {
        let (mut encoder, pool) = setup(Resolution::new(64, 64));
        let index = encoder
            .add_layer(LayerConfig {
                width: 32,
                height: 32,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(index, 1);

        let packets = encoder
            .encode(&frame(&pool, [9, 9, 9, 255]), EncodeOptions::default())
            .unwrap();
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[1].layer, 1);
        assert!(packets[1].len() < packets[0].len());
    }

    #[test]
    fn test_unaligned_size_uses_cropping() {
        let sps = sps_rbsp(Resolution::new(30, 18));
        let aligned = sps_rbsp(Resolution::new(32, 32));
        assert_ne!(sps, aligned);
        assert_eq!(level_idc(Resolution::HD1080), 40);
        assert_eq!(level_idc(Resolution::HD720), 31);
    }

    #[test]
    fn test_setup_rejects_empty_layer() {
        let pool = InputPool::with_backend(
            Box::new(HostBackend::new(PixelFormat::Bgra8)),
            Resolution::new(16, 16),
            true,
        );
        let mut encoder = SoftwareH264Encoder::new();
        assert!(encoder.setup(pool, LayerConfig::default()).is_err());
    }

    #[test]
    fn test_setup_rejects_odd_layer() {
        let pool = InputPool::with_backend(
            Box::new(HostBackend::new(PixelFormat::Bgra8)),
            Resolution::new(16, 16),
            true,
        );
        let mut encoder = SoftwareH264Encoder::new();
        let odd = LayerConfig {
            width: 31,
            height: 16,
            ..Default::default()
        };
        assert!(encoder.setup(pool, odd).is_err());
    }
}
