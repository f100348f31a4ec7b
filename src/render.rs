use std::collections::HashSet;
use std::future::Future;
use std::io::Write;

use tokio::sync::watch;

use crate::citations::displayable_prefix;
use crate::session::{Exchange, ExchangeId, SessionState};

pub struct TerminalRenderer<W: Write> {
    out: W,
    current: Option<Tracked>,
    done: HashSet<ExchangeId>,
    last_error: Option<String>,
}

struct Tracked {
    id: ExchangeId,
    printed: usize,
    finished: bool,
}

impl<W: Write> TerminalRenderer<W> {
    pub fn new(out: W) -> Self {
        Self { out, current: None, done: HashSet::new(), last_error: None }
    }

    pub fn ignore_existing(&mut self, ids: impl IntoIterator<Item = ExchangeId>) {
        self.done.extend(ids);
    }

    #[cfg(test)]
    pub fn into_inner(self) -> W {
        self.out
    }

    pub fn update(&mut self, state: &SessionState) -> std::io::Result<()> {
        let newest = state.exchanges.last().map(|e| e.id);
        if let Some((id, printed, finished)) = self.current.as_ref().map(|t| (t.id, t.printed, t.finished)) {
            if Some(id) != newest {
                match state.exchange(id) {
                    // a newer exchange replaced it; flush whatever it ended with
                    Some(ex) => self.render(ex)?,
                    // rolled back after a failure
                    None if printed > 0 && !finished => writeln!(self.out)?,
                    None => {}
                }
                self.done.insert(id);
                self.current = None;
            }
        }
        if let Some(ex) = state.exchanges.last() {
            if self.current.is_none() && !self.done.contains(&ex.id) {
                self.current = Some(Tracked { id: ex.id, printed: 0, finished: false });
            }
            self.render(ex)?;
        }

        if state.error != self.last_error {
            if let Some(message) = &state.error {
                writeln!(self.out, "error: {message}")?;
            }
            self.last_error = state.error.clone();
        }
        self.out.flush()
    }

    fn render(&mut self, ex: &Exchange) -> std::io::Result<()> {
        let Some(tracked) = self.current.as_mut().filter(|t| t.id == ex.id && !t.finished) else { return Ok(()) };
        let visible = if ex.is_streaming { displayable_prefix(&ex.assistant_text) } else { ex.assistant_text.as_str() };
        if let Some(fresh) = visible.get(tracked.printed..) {
            self.out.write_all(fresh.as_bytes())?;
            tracked.printed = visible.len();
        }
        if !ex.is_streaming {
            tracked.finished = true;
            writeln!(self.out)?;
            if !ex.sources.is_empty() {
                writeln!(self.out, "\nSources:")?;
                for source in &ex.sources {
                    writeln!(self.out, "  - {} (page {})", source.file, source.page)?;
                }
            }
        }
        Ok(())
    }
}

pub async fn drive<F, W>(
    fut: F,
    rx: &mut watch::Receiver<SessionState>,
    renderer: &mut TerminalRenderer<W>,
) -> std::io::Result<F::Output>
where
    F: Future,
    W: Write,
{
    let existing: Vec<ExchangeId> = rx.borrow_and_update().exchanges.iter().map(|e| e.id).collect();
    renderer.ignore_existing(existing);
    tokio::pin!(fut);
    let output = loop {
        tokio::select! {
            output = &mut fut => break output,
            Ok(()) = rx.changed() => {
                let state = rx.borrow_and_update().clone();
                renderer.update(&state)?;
            }
        }
    };
    if rx.has_changed().unwrap_or(false) {
        let state = rx.borrow_and_update().clone();
        renderer.update(&state)?;
    }
    Ok(output)
}
