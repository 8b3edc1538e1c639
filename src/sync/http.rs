//! Blocking HTTP implementation of [`TransferEngine`]

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, error, info, warn};

use super::cache::PARTIAL_SUFFIX;
use super::error::TransferError;
use super::transfer::{
    NetworkPolicy, TransferEngine, TransferEvent, TransferHandle, TransferListener,
    TransferRequest,
};

const CHUNK_SIZE: usize = 64 * 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

struct Job {
    listener: Option<TransferListener>,
    abort: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

type Jobs = Arc<Mutex<HashMap<u64, Job>>>;

/// Downloads each request on its own thread into `<destination>.part`, then
/// renames it into place so readers never observe a truncated file.
pub struct HttpTransferEngine {
    client: reqwest::blocking::Client,
    next_id: AtomicU64,
    jobs: Jobs,
}

impl HttpTransferEngine {
    pub fn new() -> Result<Self, TransferError> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(None::<Duration>)
            .build()
            .map_err(|e| TransferError::engine(e.to_string()))?;

        Ok(Self {
            client,
            next_id: AtomicU64::new(1),
            jobs: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Abort every running transfer and wait for the worker threads.
    pub fn shutdown(&self) {
        let threads: Vec<_> = {
            let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
            jobs.values_mut()
                .filter_map(|job| {
                    job.listener = None;
                    job.abort.store(true, Ordering::SeqCst);
                    job.thread.take()
                })
                .collect()
        };

        for thread in threads {
            if thread.join().is_err() {
                error!("Transfer worker panicked during shutdown");
            }
        }
    }
}

fn notify(jobs: &Jobs, id: u64, event: TransferEvent) {
    let listener = jobs
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&id)
        .and_then(|job| job.listener.clone());

    if let Some(listener) = listener {
        listener(event);
    }
}

fn finish(jobs: &Jobs, id: u64, event: TransferEvent) {
    notify(jobs, id, event);
    jobs.lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&id);
}

fn partial_path(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_owned();
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

enum Outcome {
    Completed,
    Aborted,
}

fn download(
    client: &reqwest::blocking::Client,
    request: &TransferRequest,
    abort: &AtomicBool,
    on_progress: impl FnMut(u64, Option<u64>),
) -> Result<Outcome, TransferError> {
    let mut response = client
        .get(&request.url)
        .send()
        .and_then(reqwest::blocking::Response::error_for_status)
        .map_err(|e| TransferError::engine(e.to_string()))?;

    let partial = partial_path(&request.destination);
    let result = write_partial(&mut response, &partial, abort, on_progress).and_then(|outcome| {
        if let Outcome::Completed = outcome {
            fs::rename(&partial, &request.destination)?;
        }
        Ok(outcome)
    });

    // Only a completed, renamed download leaves a file behind.
    if !matches!(result, Ok(Outcome::Completed)) && partial.exists() {
        if let Err(e) = fs::remove_file(&partial) {
            warn!("Failed to remove {}: {e}", partial.display());
        }
    }
    result
}

/// Stream the body into `partial`, checking `abort` between chunks.
fn write_partial(
    response: &mut reqwest::blocking::Response,
    partial: &Path,
    abort: &AtomicBool,
    mut on_progress: impl FnMut(u64, Option<u64>),
) -> Result<Outcome, TransferError> {
    let total = response.content_length();
    let mut out = BufWriter::new(File::create(partial)?);
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut done = 0u64;

    on_progress(0, total);
    loop {
        if abort.load(Ordering::SeqCst) {
            return Ok(Outcome::Aborted);
        }
        let n = match response.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        out.write_all(&buf[..n])?;
        done += n as u64;
        on_progress(done, total);
    }
    out.flush()?;

    match total {
        Some(total) if done != total => Err(TransferError::engine(format!(
            "truncated body: {done} of {total} bytes"
        ))),
        _ => Ok(Outcome::Completed),
    }
}

impl TransferEngine for HttpTransferEngine {
    fn enqueue(
        &self,
        request: TransferRequest,
        listener: TransferListener,
    ) -> Result<TransferHandle, TransferError> {
        if request.network_policy == NetworkPolicy::Unmetered {
            debug!("Metered network detection unavailable, treating as unrestricted");
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let abort = Arc::new(AtomicBool::new(false));

        // Register before spawning so the worker always finds its listener.
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner).insert(
            id,
            Job {
                listener: Some(listener),
                abort: Arc::clone(&abort),
                thread: None,
            },
        );

        let client = self.client.clone();
        let jobs = Arc::clone(&self.jobs);
        let spawned = std::thread::Builder::new()
            .name(format!("transfer-{id}"))
            .spawn(move || {
                notify(&jobs, id, TransferEvent::Queued);
                info!("Downloading {} -> {:?}", request.url, request.destination);

                let mut last_percent = None;
                let result = download(&client, &request, &abort, |done, total| {
                    let percent = total.filter(|t| *t > 0).map(|t| done * 100 / t);
                    if percent.is_none() || percent != last_percent {
                        last_percent = percent;
                        notify(&jobs, id, TransferEvent::Progress { done, total });
                    }
                });

                match result {
                    Ok(Outcome::Completed) => finish(&jobs, id, TransferEvent::Completed),
                    Ok(Outcome::Aborted) => finish(&jobs, id, TransferEvent::Cancelled),
                    Err(e) => {
                        warn!("Download of {} failed: {e}", request.url);
                        finish(&jobs, id, TransferEvent::Error(e.to_string()));
                    }
                }
            });

        match spawned {
            Ok(thread) => {
                if let Some(job) = self
                    .jobs
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .get_mut(&id)
                {
                    job.thread = Some(thread);
                }
                Ok(TransferHandle(id))
            }
            Err(e) => {
                self.jobs
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&id);
                Err(e.into())
            }
        }
    }

    fn detach(&self, handle: TransferHandle) {
        if let Some(job) = self
            .jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&handle.0)
        {
            job.listener = None;
        }
    }

    fn abort(&self, handle: TransferHandle) {
        if let Some(job) = self
            .jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&handle.0)
        {
            job.abort.store(true, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{BufRead, BufReader};
    use std::net::TcpListener;

    use tempfile::TempDir;

    use super::*;

    /// Serve one response announcing `content_length` bytes, sending `first`
    /// right away and each chunk received on `more` after it. The connection
    /// closes once every sender of `more` is gone.
    fn serve(content_length: usize, first: &'static [u8], more: flume::Receiver<&'static [u8]>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut reader = BufReader::new(stream.try_clone().unwrap());
                let mut line = String::new();
                loop {
                    line.clear();
                    match reader.read_line(&mut line) {
                        Ok(n) if n > 0 && line != "\r\n" => {}
                        _ => break,
                    }
                }
                let header = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {content_length}\r\nConnection: close\r\n\r\n"
                );
                let _ = stream.write_all(header.as_bytes());
                let _ = stream.write_all(first);
                while let Ok(chunk) = more.recv() {
                    let _ = stream.write_all(chunk);
                }
            }
        });
        format!("http://{addr}/files/plan.pdf")
    }

    fn serve_once(body: &'static [u8]) -> String {
        let (_, more) = flume::unbounded();
        serve(body.len(), body, more)
    }

    fn request(url: String, destination: &Path) -> TransferRequest {
        TransferRequest {
            url,
            destination: destination.to_path_buf(),
            priority: Default::default(),
            network_policy: Default::default(),
        }
    }

    fn channel_listener() -> (TransferListener, flume::Receiver<TransferEvent>) {
        let (tx, rx) = flume::unbounded();
        let listener: TransferListener = Arc::new(move |event| {
            let _ = tx.send(event);
        });
        (listener, rx)
    }

    fn is_terminal(event: &TransferEvent) -> bool {
        matches!(
            event,
            TransferEvent::Completed | TransferEvent::Error(_) | TransferEvent::Cancelled
        )
    }

    /// Events up to and including the first terminal one.
    fn until_terminal(rx: &flume::Receiver<TransferEvent>) -> Vec<TransferEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.recv_timeout(Duration::from_secs(10)) {
            let terminal = is_terminal(&event);
            events.push(event);
            if terminal {
                break;
            }
        }
        events
    }

    #[test]
    fn partial_path_appends_suffix() {
        assert_eq!(
            partial_path(Path::new("/c/url_high_school/plan.pdf")),
            PathBuf::from("/c/url_high_school/plan.pdf.part")
        );
    }

    #[test]
    fn downloads_into_destination_and_reports_completion() {
        let tmp = TempDir::new().unwrap();
        let destination = tmp.path().join("plan.pdf");
        let url = serve_once(b"%PDF-1.4 timetable");

        let engine = HttpTransferEngine::new().unwrap();
        let (listener, rx) = channel_listener();
        engine.enqueue(request(url, &destination), listener).unwrap();

        let events = until_terminal(&rx);
        assert_eq!(events.first(), Some(&TransferEvent::Queued));
        assert_eq!(events.last(), Some(&TransferEvent::Completed));
        assert_eq!(fs::read(&destination).unwrap(), b"%PDF-1.4 timetable");
        assert!(!partial_path(&destination).exists());
        engine.shutdown();
    }

    #[test]
    fn abort_cancels_and_removes_the_partial_file() {
        let tmp = TempDir::new().unwrap();
        let destination = tmp.path().join("plan.pdf");
        let (more_tx, more_rx) = flume::unbounded();
        let url = serve(1000, &[b'x'; 100], more_rx);

        let engine = HttpTransferEngine::new().unwrap();
        let (listener, rx) = channel_listener();
        let handle = engine.enqueue(request(url, &destination), listener).unwrap();

        // Wait until the first chunk is on disk.
        loop {
            match rx.recv_timeout(Duration::from_secs(10)).unwrap() {
                TransferEvent::Progress { done: 100, .. } => break,
                event => assert!(!is_terminal(&event), "ended early: {event:?}"),
            }
        }
        assert!(partial_path(&destination).exists());

        engine.abort(handle);
        more_tx.send(&[b'y'; 100]).unwrap();

        assert_eq!(until_terminal(&rx).last(), Some(&TransferEvent::Cancelled));
        assert!(!partial_path(&destination).exists());
        assert!(!destination.exists());
        drop(more_tx);
        engine.shutdown();
    }

    #[test]
    fn truncated_body_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let destination = tmp.path().join("plan.pdf");
        let (_, more) = flume::unbounded();
        let url = serve(100, b"%PDF-1.4", more);

        let engine = HttpTransferEngine::new().unwrap();
        let (listener, rx) = channel_listener();
        engine.enqueue(request(url, &destination), listener).unwrap();

        let events = until_terminal(&rx);
        assert!(matches!(events.last(), Some(TransferEvent::Error(_))), "{events:?}");
        assert!(!partial_path(&destination).exists());
        assert!(!destination.exists());
        engine.shutdown();
    }
}
