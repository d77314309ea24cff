use crate::{
    AcqError, CancelHandle, Counter, StreamChunk, StreamEnd, StreamObserver, StreamingSummary,
};
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind};
use log::warn;
use ratatui::{
    backend::Backend,
    buffer::Buffer,
    layout::Rect,
    style::Stylize,
    symbols::border,
    text::{Line, Text},
    widgets::{Block, Paragraph, Widget},
    Terminal,
};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

pub const REDRAW_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub struct StreamStatus {
    pub serial: String,
    pub counter: Counter,
    pub trigger_at: Option<u64>,
    pub overflowed: bool,
    pub end: Option<StreamEnd>,
}

impl StreamStatus {
    pub fn new(serial: &str) -> Self {
        Self {
            serial: serial.to_string(),
            counter: Counter::new(),
            trigger_at: None,
            overflowed: false,
            end: None,
        }
    }

    fn update(&mut self, chunk: &StreamChunk<'_>) {
        self.counter.increment(chunk.count as u64);
        if self.trigger_at.is_none() {
            self.trigger_at = chunk.trigger_at;
        }
        self.overflowed |= chunk.overflow != 0;
    }
}

impl Widget for &StreamStatus {
    fn render(self, area: Rect, buf: &mut Buffer) {
        let title = Line::from(format!(" PicoScope {} Streaming ", self.serial).bold());
        let instructions = Line::from(vec![" Quit ".into(), "<Q> ".blue().bold()]);
        let block = Block::bordered()
            .title(title.centered())
            .title_bottom(instructions.centered())
            .border_set(border::THICK);

        let trigger = match self.trigger_at {
            Some(at) => at.to_string().yellow(),
            None => "none".to_string().yellow(),
        };
        let overflow = if self.overflowed {
            "yes".red().bold()
        } else {
            "no".yellow()
        };
        let end = match self.end {
            Some(end) => format!("{end:?}").green(),
            None => "running".to_string().yellow(),
        };

        let status_text = Text::from(vec![
            Line::from(vec![
                "Elapsed time: ".into(),
                self.counter
                    .t_begin
                    .elapsed()
                    .as_secs()
                    .to_string()
                    .yellow(),
                " s".into(),
                " Samples: ".into(),
                self.counter.total_samples.to_string().yellow(),
                " Rate: ".into(),
                format!("{:.0}", self.counter.rate()).yellow(),
                " S/s".into(),
            ]),
            Line::from(vec![
                "Trigger at: ".into(),
                trigger,
                " Overflow: ".into(),
                overflow,
                " State: ".into(),
                end,
            ]),
        ]);

        Paragraph::new(status_text)
            .centered()
            .block(block)
            .render(area, buf);
    }
}

/// Wraps another observer and keeps a status screen up to date.
pub struct StreamMonitor<'t, O: StreamObserver, B: Backend> {
    inner: O,
    terminal: &'t mut Terminal<B>,
    pub status: StreamStatus,
    redraw_interval: Duration,
    last_draw: Option<Instant>,
}

impl<'t, O: StreamObserver, B: Backend> StreamMonitor<'t, O, B> {
    pub fn new(inner: O, terminal: &'t mut Terminal<B>, serial: &str) -> Self {
        Self {
            inner,
            terminal,
            status: StreamStatus::new(serial),
            redraw_interval: REDRAW_INTERVAL,
            last_draw: None,
        }
    }

    pub fn with_redraw_interval(mut self, interval: Duration) -> Self {
        self.redraw_interval = interval;
        self
    }

    pub fn into_inner(self) -> O {
        self.inner
    }

    fn draw(&mut self) -> Result<(), AcqError> {
        let status = &self.status;
        self.terminal
            .draw(|frame| frame.render_widget(status, frame.area()))?;
        self.last_draw = Some(Instant::now());
        Ok(())
    }
}

impl<O: StreamObserver, B: Backend> StreamObserver for StreamMonitor<'_, O, B> {
    fn on_chunk(&mut self, chunk: &StreamChunk<'_>) -> Result<(), AcqError> {
        self.inner.on_chunk(chunk)?;
        self.status.update(chunk);
        let due = self
            .last_draw
            .map_or(true, |t| t.elapsed() >= self.redraw_interval);
        if due {
            self.draw()?;
        }
        Ok(())
    }

    fn on_end(&mut self, summary: &StreamingSummary) -> Result<(), AcqError> {
        self.inner.on_end(summary)?;
        self.status.end = Some(summary.end);
        self.status.trigger_at = summary.trigger_at;
        self.draw()
    }
}

fn is_quit(key: KeyEvent) -> bool {
    key.kind == KeyEventKind::Press && matches!(key.code, KeyCode::Char('q') | KeyCode::Esc)
}

/// Watches the keyboard on its own thread and cancels on `q` or Esc.
/// Exits when `stop` is set.
pub fn spawn_key_watcher(cancel: CancelHandle, stop: Arc<AtomicBool>) -> JoinHandle<()> {
    thread::spawn(move || {
        while !stop.load(Ordering::SeqCst) {
            match event::poll(Duration::from_millis(50)) {
                Ok(false) => {}
                Ok(true) => match event::read() {
                    Ok(Event::Key(key)) if is_quit(key) => {
                        cancel.cancel();
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("Key watcher stopped: {e}");
                        break;
                    }
                },
                Err(e) => {
                    warn!("Key watcher stopped: {e}");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BufferPool, Discard, Resolution, TimeUnits, UnitModel};
    use crossterm::event::KeyModifiers;
    use ratatui::backend::TestBackend;

    fn screen(terminal: &Terminal<TestBackend>) -> String {
        terminal
            .backend()
            .buffer()
            .content
            .iter()
            .map(|cell| cell.symbol())
            .collect()
    }

    #[test]
    fn status_screen_tracks_chunks() {
        let unit = UnitModel::new("5242D", "SIM00/001", 2, Resolution::Bits8, 32512);
        let pool = BufferPool::allocate(&unit, 100).unwrap();
        let mut terminal = Terminal::new(TestBackend::new(100, 5)).unwrap();

        let mut monitor = StreamMonitor::new(Discard, &mut terminal, &unit.serial)
            .with_redraw_interval(Duration::ZERO);
        for (i, trigger_at) in [None, Some(150), None].into_iter().enumerate() {
            let chunk = StreamChunk {
                pool: &pool,
                unit: &unit,
                start: 0,
                count: 100,
                first_sample: i as u64 * 100,
                trigger_at,
                overflow: if i == 2 { 1 } else { 0 },
            };
            monitor.on_chunk(&chunk).unwrap();
        }
        assert_eq!(monitor.status.counter.total_samples, 300);
        assert_eq!(monitor.status.trigger_at, Some(150));
        assert!(monitor.status.overflowed);

        monitor
            .on_end(&StreamingSummary {
                total_samples: 300,
                trigger_at: Some(150),
                end: StreamEnd::AutoStop,
                polls: 3,
                power_changes: 0,
                overflowed: true,
                sample_interval: 1,
                time_units: TimeUnits::Us,
            })
            .unwrap();
        drop(monitor);

        let text = screen(&terminal);
        assert!(text.contains("PicoScope SIM00/001 Streaming"));
        assert!(text.contains("Samples: 300"));
        assert!(text.contains("Trigger at: 150"));
        assert!(text.contains("AutoStop"));
    }

    #[test]
    fn quit_keys() {
        let press = |code| KeyEvent::new(code, KeyModifiers::NONE);
        assert!(is_quit(press(KeyCode::Char('q'))));
        assert!(is_quit(press(KeyCode::Esc)));
        assert!(!is_quit(press(KeyCode::Char('x'))));
    }
}
