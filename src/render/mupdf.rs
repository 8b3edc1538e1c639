//! MuPDF-backed document decoder
//!
//! MuPDF documents are not `Send`, so each open document lives on its own
//! worker thread and is driven through a flume channel.

use std::path::Path;
use std::thread::JoinHandle;

use flume::{Receiver, Sender};
use log::{debug, error};
use mupdf::{Colorspace, Device, Document, Matrix, Pixmap, Rect};

use super::bitmap::{BYTES_PER_PIXEL, Bitmap};
use super::decoder::{DocumentDecoder, PageDecoder, Transform};
use super::error::DecodeError;

struct RenderJob {
    transform: Transform,
    width: u32,
    height: u32,
    reply: Sender<Result<Vec<u8>, DecodeError>>,
}

/// Opens PDF files with MuPDF.
#[derive(Debug, Default, Clone, Copy)]
pub struct MupdfDecoder;

impl MupdfDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl DocumentDecoder for MupdfDecoder {
    fn open(&self, path: &Path) -> Result<Box<dyn PageDecoder>, DecodeError> {
        let (ready_tx, ready_rx) = flume::bounded(1);
        let (jobs_tx, jobs_rx) = flume::unbounded();
        let doc_path = path.to_path_buf();

        let thread = std::thread::Builder::new()
            .name("pdf-decoder".to_string())
            .spawn(move || decoder_worker(&doc_path, &ready_tx, &jobs_rx))?;

        let size = match ready_rx.recv() {
            Ok(result) => result?,
            Err(_) => return Err(DecodeError::generic("decoder thread exited during open")),
        };

        Ok(Box::new(MupdfPage {
            size,
            jobs: Some(jobs_tx),
            thread: Some(thread),
        }))
    }
}

struct MupdfPage {
    size: (f32, f32),
    jobs: Option<Sender<RenderJob>>,
    thread: Option<JoinHandle<()>>,
}

impl PageDecoder for MupdfPage {
    fn page_size(&self) -> (f32, f32) {
        self.size
    }

    fn render(&mut self, transform: Transform, target: &mut Bitmap) -> Result<(), DecodeError> {
        let jobs = self
            .jobs
            .as_ref()
            .ok_or_else(|| DecodeError::generic("decoder already closed"))?;

        let (reply, response) = flume::bounded(1);
        jobs.send(RenderJob {
            transform,
            width: target.width(),
            height: target.height(),
            reply,
        })
        .map_err(|_| DecodeError::generic("decoder thread is gone"))?;

        let pixels = response
            .recv()
            .map_err(|_| DecodeError::generic("decoder thread dropped the request"))??;
        target.pixels_mut().copy_from_slice(&pixels);
        Ok(())
    }
}

impl Drop for MupdfPage {
    fn drop(&mut self) {
        // Closing the channel ends the worker loop.
        self.jobs = None;
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("PDF decoder thread panicked");
            }
        }
    }
}

fn decoder_worker(
    path: &Path,
    ready: &Sender<Result<(f32, f32), DecodeError>>,
    jobs: &Receiver<RenderJob>,
) {
    let opened = open_document(path);
    let (doc, bounds) = match opened {
        Ok(opened) => opened,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    let size = (bounds.x1 - bounds.x0, bounds.y1 - bounds.y0);
    if ready.send(Ok(size)).is_err() {
        return;
    }
    debug!("Decoder ready for {}", path.display());

    for job in jobs.iter() {
        let result = render_job(&doc, &bounds, &job);
        let _ = job.reply.send(result);
    }
    debug!("Decoder closed for {}", path.display());
}

/// Open the document and read the bounds of its first page.
fn open_document(path: &Path) -> Result<(Document, Rect), DecodeError> {
    let doc = Document::open(path.to_string_lossy().as_ref()).map_err(pdf_error)?;
    if doc.page_count().map_err(pdf_error)? < 1 {
        return Err(DecodeError::Empty);
    }
    let bounds = doc.load_page(0).and_then(|page| page.bounds()).map_err(pdf_error)?;
    Ok((doc, bounds))
}

/// Draw only the requested window of the page into a pixmap of exactly the
/// target size.
fn render_job(doc: &Document, bounds: &Rect, job: &RenderJob) -> Result<Vec<u8>, DecodeError> {
    let (width, height) = (pixmap_side(job.width)?, pixmap_side(job.height)?);
    let scale = job.transform.scale;
    let page = doc.load_page(0).map_err(pdf_error)?;

    // Scale, then shift so the window's top-left lands on pixel (0, 0).
    let matrix = Matrix::new(
        scale,
        0.0,
        0.0,
        scale,
        -(bounds.x0 * scale + job.transform.offset_x),
        -(bounds.y0 * scale + job.transform.offset_y),
    );

    let mut pixmap =
        Pixmap::new(&Colorspace::device_rgb(), 0, 0, width, height, true).map_err(pdf_error)?;
    pixmap.clear().map_err(pdf_error)?;
    {
        let device = Device::from_pixmap(&pixmap).map_err(pdf_error)?;
        page.run(&device, &matrix).map_err(pdf_error)?;
    }

    to_straight_rgba(&pixmap, (job.width, job.height))
}

fn pixmap_side(value: u32) -> Result<i32, DecodeError> {
    i32::try_from(value).map_err(|_| DecodeError::OutOfMemory {
        detail: format!("{value} pixels exceeds the pixmap limit"),
    })
}

/// Allocation failures say nothing about the document; keep them apart.
fn pdf_error(err: mupdf::error::Error) -> DecodeError {
    let message = err.to_string();
    if is_allocation_failure(&message) {
        DecodeError::OutOfMemory { detail: message }
    } else {
        DecodeError::Pdf(err)
    }
}

fn is_allocation_failure(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    ["out of memory", "malloc", "calloc", "realloc", "cannot allocate"]
        .iter()
        .any(|needle| message.contains(needle))
}

/// Convert a premultiplied RGBA pixmap of `width` x `height` to straight alpha.
fn to_straight_rgba(pixmap: &Pixmap, (width, height): (u32, u32)) -> Result<Vec<u8>, DecodeError> {
    let n = pixmap.n() as usize;
    if n != 4 {
        return Err(DecodeError::generic(format!(
            "Unsupported pixmap format: {n} channels"
        )));
    }
    if (pixmap.width(), pixmap.height()) != (width, height) {
        return Err(DecodeError::generic(format!(
            "Pixmap is {}x{}, expected {width}x{height}",
            pixmap.width(),
            pixmap.height()
        )));
    }

    let stride = pixmap.stride() as usize;
    let row_len = width as usize * n;
    let samples = pixmap.samples();

    let mut out = Vec::with_capacity(width as usize * height as usize * BYTES_PER_PIXEL);
    for row in 0..height as usize {
        let start = row * stride;
        let Some(line) = samples.get(start..start + row_len) else {
            return Err(DecodeError::generic("Pixmap buffer size mismatch"));
        };
        for px in line.chunks_exact(n) {
            out.extend_from_slice(&unpremultiply([px[0], px[1], px[2], px[3]]));
        }
    }
    Ok(out)
}

fn unpremultiply([r, g, b, a]: [u8; 4]) -> [u8; 4] {
    match a {
        0 => [0, 0, 0, 0],
        255 => [r, g, b, a],
        _ => {
            let un = |c: u8| ((u16::from(c) * 255 + u16::from(a) / 2) / u16::from(a)).min(255) as u8;
            [un(r), un(g), un(b), a]
        }
    }
}
