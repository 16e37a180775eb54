//! Matroska clip writer: one appsrc per track into matroskamux.

use std::path::{Path, PathBuf};
use std::time::Duration;

use gst::prelude::*;
use gstreamer as gst;
use gstreamer_app as gst_app;

use rewind_common::error::{RewindError, RewindResult};

use crate::container::{ContainerFactory, ContainerWriter, Sample, TrackHandle};
use crate::frame::StreamFormat;
use crate::pipeline::{drain_until_eos, init_gstreamer, take_bus_error};

const FINISH_TIMEOUT: Duration = Duration::from_secs(10);

/// Opens [`GstContainerWriter`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct GstContainerFactory;

impl ContainerFactory for GstContainerFactory {
    fn open(&self, path: &Path) -> RewindResult<Box<dyn ContainerWriter>> {
        Ok(Box::new(GstContainerWriter::open(path)?))
    }

    fn extension(&self) -> &str {
        "mkv"
    }
}

pub struct GstContainerWriter {
    path: PathBuf,
    pipeline: gst::Pipeline,
    mux: gst::Element,
    sources: Vec<gst_app::AppSrc>,
    started: bool,
}

impl GstContainerWriter {
    pub fn open(path: &Path) -> RewindResult<Self> {
        init_gstreamer()?;
        // Surface permission and disk errors now rather than on the
        // streaming thread.
        std::fs::File::create(path)?;

        let location = path
            .to_str()
            .ok_or_else(|| RewindError::container(format!("Non UTF-8 clip path {}", path.display())))?;
        let pipeline = gst::Pipeline::with_name("clip-mux");
        let mux = gst::ElementFactory::make("matroskamux")
            .name("mux")
            .build()
            .map_err(|_| RewindError::container("Failed to create matroskamux element"))?;
        let filesink = gst::ElementFactory::make("filesink")
            .name("file")
            .property("location", location)
            .build()
            .map_err(|_| RewindError::container("Failed to create filesink element"))?;

        pipeline
            .add_many([&mux, &filesink])
            .map_err(|e| RewindError::container(format!("Failed to assemble muxer: {e}")))?;
        mux.link(&filesink)
            .map_err(|e| RewindError::container(format!("Failed to link muxer: {e}")))?;

        Ok(Self {
            path: path.to_path_buf(),
            pipeline,
            mux,
            sources: Vec::new(),
            started: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ContainerWriter for GstContainerWriter {
    fn add_track(&mut self, format: &StreamFormat) -> RewindResult<TrackHandle> {
        if self.started {
            return Err(RewindError::container("Tracks must be added before start"));
        }
        let caps = format
            .caps
            .parse::<gst::Caps>()
            .map_err(|e| RewindError::container(format!("Invalid {} caps: {e}", format.kind)))?;

        let index = self.sources.len();
        let appsrc = gst_app::AppSrc::builder()
            .name(format!("track{index}"))
            .caps(&caps)
            .format(gst::Format::Time)
            .build();

        self.pipeline
            .add(&appsrc)
            .map_err(|e| RewindError::container(format!("Failed to add track: {e}")))?;
        appsrc
            .link(&self.mux)
            .map_err(|e| RewindError::container(format!("Muxer refused {} track: {e}", format.kind)))?;

        self.sources.push(appsrc);
        Ok(TrackHandle(index))
    }

    fn start(&mut self) -> RewindResult<()> {
        self.pipeline.set_state(gst::State::Playing).map_err(|e| {
            RewindError::container(format!("Failed to start muxer: {e:?}"))
        })?;
        self.started = true;
        Ok(())
    }

    fn write_sample(&mut self, track: TrackHandle, sample: Sample) -> RewindResult<()> {
        if let Some(error) = take_bus_error(&self.pipeline) {
            return Err(RewindError::container(format!("Muxer error: {error}")));
        }
        let appsrc = self
            .sources
            .get(track.0)
            .ok_or_else(|| RewindError::container(format!("Unknown track {}", track.0)))?;

        let mut buffer = gst::Buffer::from_slice(sample.data);
        if let Some(buf) = buffer.get_mut() {
            buf.set_pts(gst::ClockTime::from_useconds(sample.pts_us.max(0) as u64));
            if !sample.key_frame {
                buf.set_flags(gst::BufferFlags::DELTA_UNIT);
            }
        }
        appsrc
            .push_buffer(buffer)
            .map_err(|e| RewindError::container(format!("Failed to write sample: {e:?}")))?;
        Ok(())
    }

    fn stop(&mut self) -> RewindResult<()> {
        if !self.started {
            return Ok(());
        }
        self.started = false;
        for appsrc in &self.sources {
            if let Err(e) = appsrc.end_of_stream() {
                tracing::warn!(track = %appsrc.name(), error = ?e, "Failed to end track");
            }
        }
        drain_until_eos(&self.pipeline, "clip-mux", FINISH_TIMEOUT);
        Ok(())
    }

    fn release(&mut self) -> RewindResult<()> {
        self.pipeline.set_state(gst::State::Null).map_err(|e| {
            RewindError::container(format!("Failed to release muxer: {e:?}"))
        })?;
        Ok(())
    }
}

impl Drop for GstContainerWriter {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}
