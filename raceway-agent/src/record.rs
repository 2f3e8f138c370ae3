use std::{fs::File, io, path::Path};

use crossbeam_channel::{Receiver, Sender};
use raceway_api::Event;
use serde::Serialize;

/// This marks the currently understood version of the recording format.
/// Increase it whenever the format changes in a way old readers cannot
/// parse.
const DATA_FORMAT_VERSION: u8 = 1;

/// Writes every captured event to a local JSON-lines file, for offline
/// debugging without a collector. Enabled by the `recording_path` config.
#[derive(Debug)]
pub(crate) struct Recorder {
    tx: Sender<Event>,
    _worker: std::thread::JoinHandle<()>,
}

#[derive(Serialize)]
struct Header {
    v: u8,
}

impl Recorder {
    pub(crate) fn new(path: &Path) -> io::Result<Self> {
        let file = File::create(path)?;
        let (tx, rx) = crossbeam_channel::bounded(4096);
        let _worker = std::thread::Builder::new()
            .name("raceway/agent/recorder/io".into())
            .spawn(move || {
                if let Err(error) = record_io(file, rx) {
                    tracing::warn!(%error, "event recorder failed");
                }
            })?;

        Ok(Recorder { tx, _worker })
    }

    /// Never blocks the tracker: a full or disconnected channel skips the
    /// event.
    pub(crate) fn record(&self, event: Event) {
        if self.tx.try_send(event).is_err() {
            tracing::debug!("recorder channel unavailable; skipping event");
        }
    }
}

fn record_io(file: File, rx: Receiver<Event>) -> io::Result<()> {
    use std::io::{BufWriter, Write};

    fn write<T: Serialize>(file: &mut BufWriter<File>, val: &T) -> io::Result<()> {
        serde_json::to_writer(&mut *file, val)?;
        file.write_all(b"\n")
    }

    let mut file = BufWriter::new(file);
    write(
        &mut file,
        &Header {
            v: DATA_FORMAT_VERSION,
        },
    )?;

    // wait to receive an event...
    while let Ok(event) = rx.recv() {
        write(&mut file, &event)?;

        // drain any additional events that are ready now
        while let Ok(event) = rx.try_recv() {
            write(&mut file, &event)?;
        }

        file.flush()?;
    }

    tracing::debug!("event stream ended; flushing recording");
    file.flush()
}
