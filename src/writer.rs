use crate::{
    AcqError, Channel, RapidBlockResult, Segment, StreamChunk, StreamObserver, StreamingSummary,
    UnitModel,
};
use std::io::{self, Write};

/// Samples per channel shown for each capture in the capture log.
pub const CAPTURE_LOG_SAMPLES: usize = 10;

fn mv_rounded(unit: &UnitModel, raw: i16, channel: Channel) -> i32 {
    unit.adc_to_mv(raw, channel).round() as i32
}

/// Human-readable streaming log: one line per sample with max and min of
/// every channel, as ADC counts and millivolts.
pub struct StreamLog<W: Write> {
    out: W,
    header_written: bool,
}

impl<W: Write> StreamLog<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            header_written: false,
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> StreamObserver for StreamLog<W> {
    fn on_chunk(&mut self, chunk: &StreamChunk<'_>) -> Result<(), AcqError> {
        let channels: Vec<Channel> = chunk.pool.channels().collect();
        if !self.header_written {
            writeln!(
                self.out,
                "For each of the {} channels, results shown are....",
                channels.len()
            )?;
            writeln!(
                self.out,
                "Maximum aggregated value ADC count & mV, minimum aggregated value ADC count & mV\n"
            )?;
            self.header_written = true;
        }

        for i in chunk.start..chunk.start + chunk.count {
            for &channel in &channels {
                let (Some(max), Some(min)) =
                    (chunk.pool.app_max(channel), chunk.pool.app_min(channel))
                else {
                    continue;
                };
                write!(
                    self.out,
                    "Ch{channel} {:6} = {:+6}mV, {:6} = {:+6}mV   ",
                    max[i],
                    mv_rounded(chunk.unit, max[i], channel),
                    min[i],
                    mv_rounded(chunk.unit, min[i], channel)
                )?;
            }
            writeln!(self.out)?;
        }
        Ok(())
    }

    fn on_end(&mut self, summary: &StreamingSummary) -> Result<(), AcqError> {
        writeln!(
            self.out,
            "\n{} samples, end: {:?}, trigger: {}",
            summary.total_samples,
            summary.end,
            summary
                .trigger_at
                .map_or_else(|| "none".to_string(), |at| at.to_string())
        )?;
        self.out.flush()?;
        Ok(())
    }
}

/// Per capture: trigger timing and the first few samples of each channel,
/// in mV or ADC counts depending on `unit.scale_voltages`.
pub fn write_capture_log<W: Write>(
    out: &mut W,
    result: &RapidBlockResult,
    unit: &UnitModel,
) -> io::Result<()> {
    writeln!(
        out,
        "Rapid block: {} waveform(s) requested, {} segment(s), {} captured",
        result.requested,
        result.segments_configured,
        result.captures()
    )?;
    let units = if unit.scale_voltages { "mV" } else { "ADC" };

    for segment in &result.segments {
        writeln!(out, "\nCapture {}:", segment.index)?;
        writeln!(out, "  Trigger status: {}", segment.trigger.status)?;
        writeln!(out, "  Trigger index: {}", segment.trigger.trigger_index)?;
        writeln!(
            out,
            "  Timestamp counter: {}",
            segment.trigger.timestamp_counter
        )?;
        match segment.elapsed_ns {
            Some(ns) => writeln!(out, "  Time since previous trigger: {ns} ns")?,
            None => writeln!(out, "  Time since previous trigger: n/a")?,
        }

        for (row, &channel) in result.channels.iter().enumerate() {
            write!(out, "  Ch{channel} ({units}):")?;
            for &raw in segment.data.row(row).iter().take(CAPTURE_LOG_SAMPLES) {
                if unit.scale_voltages {
                    write!(out, " {:+}", mv_rounded(unit, raw, channel))?;
                } else {
                    write!(out, " {raw}")?;
                }
            }
            writeln!(out)?;
        }
    }
    Ok(())
}

/// Tab-delimited table of every segment: capture index, time, then raw and
/// mV per channel. Time restarts at zero for each capture.
pub fn write_block_table<W: Write>(
    out: &mut W,
    segments: &[Segment],
    channels: &[Channel],
    unit: &UnitModel,
    interval_ns: i64,
) -> io::Result<()> {
    write!(out, "Capture\tTime (ns)")?;
    for channel in channels {
        write!(out, "\tADC_ch{channel}\tmV_ch{channel}")?;
    }
    writeln!(out)?;

    for segment in segments {
        for i in 0..segment.data.ncols() {
            write!(out, "{}\t{}", segment.index, i as i64 * interval_ns)?;
            for (row, &channel) in channels.iter().enumerate() {
                let raw = segment.data[[row, i]];
                write!(out, "\t{raw}\t{}", mv_rounded(unit, raw, channel))?;
            }
            writeln!(out)?;
        }
    }
    Ok(())
}

/// Fixed-layout binary records: five little-endian `i32` per sample
/// (time ns, ADC A, mV A, ADC B, mV B). A channel not captured writes zeros.
pub struct BinaryRecordWriter<W: Write> {
    out: W,
    records: u64,
}

impl<W: Write> BinaryRecordWriter<W> {
    pub const RECORD_LEN: usize = 5 * 4;

    pub fn new(out: W) -> Self {
        Self { out, records: 0 }
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn write_segment(
        &mut self,
        segment: &Segment,
        channels: &[Channel],
        unit: &UnitModel,
        interval_ns: i64,
    ) -> io::Result<()> {
        let row_of = |wanted: Channel| channels.iter().position(|&c| c == wanted);
        let (row_a, row_b) = (row_of(Channel::A), row_of(Channel::B));

        let mut record = [0u8; Self::RECORD_LEN];
        for i in 0..segment.data.ncols() {
            let time = (i as i64 * interval_ns).clamp(i32::MIN as i64, i32::MAX as i64) as i32;
            let mut fields = [time, 0, 0, 0, 0];
            for (slot, row, channel) in [(1, row_a, Channel::A), (3, row_b, Channel::B)] {
                if let Some(row) = row {
                    let raw = segment.data[[row, i]];
                    fields[slot] = i32::from(raw);
                    fields[slot + 1] = mv_rounded(unit, raw, channel);
                }
            }
            for (chunk, value) in record.chunks_exact_mut(4).zip(fields) {
                chunk.copy_from_slice(&value.to_le_bytes());
            }
            self.out.write_all(&record)?;
            self.records += 1;
        }
        Ok(())
    }

    pub fn finish(mut self) -> io::Result<W> {
        self.out.flush()?;
        Ok(self.out)
    }
}

#[cfg(feature = "hdf5")]
pub use self::h5::Hdf5Writer;

#[cfg(feature = "hdf5")]
mod h5 {
    use anyhow::{anyhow, Result};
    use hdf5::{Dataset, File};
    use ndarray::{s, Array2, Array3};
    use std::path::Path;

    /// Buffers rapid-block segments and writes them to `timestamps` and
    /// `waveforms` datasets in chunks.
    pub struct Hdf5Writer {
        pub file: File,
        pub current_segment: usize,
        pub max_segments: usize,
        pub timestamps: Dataset,
        pub waveforms: Dataset,
        pub buffer_capacity: usize,
        pub buffer_count: usize,
        pub ts_buffer: Array2<u64>,
        pub wf_buffer: Array3<i16>,
        pub n_channels: usize,
        pub n_samples: usize,
    }

    impl Hdf5Writer {
        pub fn new(
            filename: &Path,
            n_channels: usize,
            n_samples: usize,
            max_segments: usize,
            buffer_capacity: usize,
        ) -> Result<Self> {
            let file = File::create(filename)?;
            let buffer_capacity = buffer_capacity.clamp(1, max_segments.max(1));

            let timestamps = file
                .new_dataset::<u64>()
                .shape((max_segments, 1))
                .chunk((buffer_capacity, 1))
                .create("timestamps")?;
            let waveforms = file
                .new_dataset::<i16>()
                .shape((max_segments, n_channels, n_samples))
                .chunk((buffer_capacity, n_channels, n_samples))
                .create("waveforms")?;

            Ok(Self {
                file,
                current_segment: 0,
                max_segments,
                timestamps,
                waveforms,
                buffer_capacity,
                buffer_count: 0,
                ts_buffer: Array2::zeros((buffer_capacity, 1)),
                wf_buffer: Array3::zeros((buffer_capacity, n_channels, n_samples)),
                n_channels,
                n_samples,
            })
        }

        pub fn append_segment(&mut self, timestamp: u64, data: &Array2<i16>) -> Result<()> {
            let (channels, samples) = data.dim();
            if channels != self.n_channels || samples != self.n_samples {
                return Err(anyhow!("Segment dimensions do not match dataset dimensions"));
            }
            if self.current_segment + self.buffer_count >= self.max_segments {
                return Err(anyhow!("Maximum number of segments reached"));
            }

            self.ts_buffer[[self.buffer_count, 0]] = timestamp;
            self.wf_buffer
                .slice_mut(s![self.buffer_count, .., ..])
                .assign(data);
            self.buffer_count += 1;

            if self.buffer_count == self.buffer_capacity {
                self.flush()?;
            }
            Ok(())
        }

        pub fn flush(&mut self) -> Result<()> {
            if self.buffer_count == 0 {
                return Ok(());
            }
            let range = self.current_segment..self.current_segment + self.buffer_count;

            let ts = self.ts_buffer.slice(s![0..self.buffer_count, ..]).to_owned();
            self.timestamps.write_slice(&ts, (range.clone(), ..))?;
            let wf = self
                .wf_buffer
                .slice(s![0..self.buffer_count, .., ..])
                .to_owned();
            self.waveforms.write_slice(&wf, (range, .., ..))?;

            self.current_segment += self.buffer_count;
            self.buffer_count = 0;
            Ok(())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use ndarray::Ix3;

        #[test]
        fn segments_round_trip_through_the_file() {
            let path = std::env::temp_dir()
                .join(format!("pico_daq_segments_{}.h5", std::process::id()));
            let mut writer = Hdf5Writer::new(&path, 2, 4, 3, 2).unwrap();
            for seg in 0..3i16 {
                let data = Array2::from_shape_fn((2, 4), |(ch, i)| {
                    seg * 100 + ch as i16 * 10 + i as i16
                });
                writer.append_segment(1000 + seg as u64, &data).unwrap();
            }
            assert_eq!(writer.current_segment, 2);
            writer.flush().unwrap();
            assert_eq!(writer.current_segment, 3);
            assert!(writer
                .append_segment(9999, &Array2::zeros((2, 4)))
                .is_err());
            assert!(writer
                .append_segment(0, &Array2::zeros((1, 4)))
                .is_err());
            drop(writer);

            let file = File::open(&path).unwrap();
            let timestamps: Array2<u64> =
                file.dataset("timestamps").unwrap().read_2d().unwrap();
            assert_eq!(timestamps.column(0).to_vec(), vec![1000, 1001, 1002]);
            let waveforms = file
                .dataset("waveforms")
                .unwrap()
                .read::<i16, Ix3>()
                .unwrap();
            assert_eq!(waveforms.dim(), (3, 2, 4));
            assert_eq!(waveforms[[0, 0, 0]], 0);
            assert_eq!(waveforms[[1, 1, 2]], 112);
            assert_eq!(waveforms[[2, 0, 3]], 203);
            drop(file);
            std::fs::remove_file(&path).unwrap();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BlockEnd, PicoStatus, Resolution, TriggerInfo};
    use ndarray::Array2;

    fn unit() -> UnitModel {
        UnitModel::new("5242D", "X", 2, Resolution::Bits8, 32512)
    }

    fn segment(index: u32, data: Vec<i16>, cols: usize, elapsed_ns: Option<u64>) -> Segment {
        let rows = data.len() / cols;
        Segment {
            index,
            data: Array2::from_shape_vec((rows, cols), data).unwrap(),
            overflow: 0,
            trigger: TriggerInfo {
                trigger_index: 1,
                timestamp_counter: 1000 + u64::from(index),
                ..TriggerInfo::default()
            },
            elapsed_ns,
        }
    }

    #[test]
    fn table_has_header_and_one_row_per_sample() {
        let seg = segment(0, vec![0, 32512, -32512, 6502, 0, 13005], 3, None);
        let mut out = Vec::new();
        write_block_table(&mut out, &[seg], &[Channel::A, Channel::B], &unit(), 8).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines[0], "Capture\tTime (ns)\tADC_chA\tmV_chA\tADC_chB\tmV_chB");
        assert_eq!(lines[1], "0\t0\t0\t0\t6502\t1000");
        assert_eq!(lines[2], "0\t8\t32512\t5000\t0\t0");
        assert_eq!(lines[3], "0\t16\t-32512\t-5000\t13005\t2000");
        assert_eq!(lines.len(), 4);
    }

    #[test]
    fn table_covers_every_capture() {
        let segments = [
            segment(0, vec![100, 200], 2, None),
            segment(1, vec![300, 400], 2, Some(8000)),
            segment(2, vec![500, 600], 2, Some(8000)),
        ];
        let mut out = Vec::new();
        write_block_table(&mut out, &segments, &[Channel::A], &unit(), 4).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines.len(), 1 + 3 * 2);
        assert_eq!(lines[0].matches("Time (ns)").count(), 1);
        assert_eq!(lines[3], "1\t0\t300\t46");
        assert_eq!(lines[6], "2\t4\t600\t92");
    }

    #[test]
    fn binary_records_zero_missing_channels() {
        let seg = segment(0, vec![32512, -6502], 2, None);
        let mut writer = BinaryRecordWriter::new(Vec::new());
        writer.write_segment(&seg, &[Channel::A], &unit(), 4).unwrap();
        assert_eq!(writer.records(), 2);
        let bytes = writer.finish().unwrap();
        assert_eq!(bytes.len(), 2 * BinaryRecordWriter::<Vec<u8>>::RECORD_LEN);

        let fields: Vec<i32> = bytes
            .chunks_exact(4)
            .map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        assert_eq!(fields, vec![0, 32512, 5000, 0, 0, 4, -6502, -1000, 0, 0]);
    }

    #[test]
    fn capture_log_lists_timing_and_first_samples() {
        let mut unit = unit();
        let first: Vec<i16> = (0..24).collect();
        let mut second = segment(1, vec![650; 24], 12, Some(8000));
        second.trigger.status = PicoStatus::Unknown(0x0100_0000);
        let result = RapidBlockResult {
            requested: 4,
            segments_configured: 2,
            timebase: None,
            channels: vec![Channel::A, Channel::B],
            samples: 12,
            segments: vec![segment(0, first, 12, None), second],
            end: BlockEnd::Completed,
        };

        unit.scale_voltages = false;
        let mut out = Vec::new();
        write_capture_log(&mut out, &result, &unit).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("4 waveform(s) requested, 2 segment(s), 2 captured"));
        assert!(text.contains("Time since previous trigger: n/a"));
        assert!(text.contains("Time since previous trigger: 8000 ns"));
        assert!(text.contains("  ChA (ADC): 0 1 2 3 4 5 6 7 8 9\n"));
        assert!(text.contains("  ChB (ADC): 12 13 14 15 16 17 18 19 20 21\n"));

        unit.scale_voltages = true;
        let mut out = Vec::new();
        write_capture_log(&mut out, &result, &unit).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("  ChA (mV): +100 +100"));
    }
}
