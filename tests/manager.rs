use std::io::Write;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use tempfile::NamedTempFile;

use multicam_ingest::{
    BackendKind, BufferCapacity, CaptureBackend, CaptureMethod, Frame, ManagerOptions,
    SourceDescriptor, SourceEntry, SourceInfo, StreamConfig, VideoManager, VideoStream,
};

fn source_list(lines: &[&str]) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp source list");
    for line in lines {
        writeln!(file, "{}", line).expect("write source list");
    }
    file
}

fn wait_for(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let until = Instant::now() + deadline;
    while Instant::now() < until {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    check()
}

#[test]
fn all_file_list_gets_unbounded_buffers() -> Result<()> {
    let video_a = NamedTempFile::new()?;
    let video_b = NamedTempFile::new()?;
    let line_a = format!("a,file:{}", video_a.path().display());
    let line_b = format!("b,file:{}", video_b.path().display());
    let list = source_list(&["# recorded clips", &line_a, &line_b]);

    let manager = VideoManager::from_list_file(list.path(), &ManagerOptions::default())?;
    assert_eq!(manager.names(), vec!["a", "b"]);
    for name in manager.names() {
        let stream = manager.stream(name).expect("stream");
        assert_eq!(stream.buffer_capacity(), BufferCapacity::Unbounded);
    }
    Ok(())
}

#[test]
fn mixed_list_keeps_default_capacity() -> Result<()> {
    let video = NamedTempFile::new()?;
    let line = format!("clip,file:{}", video.path().display());
    let list = source_list(&[&line, "yard,stub:yard"]);

    let manager = VideoManager::from_list_file(list.path(), &ManagerOptions::default())?;
    let stream = manager.stream("yard").expect("stream");
    assert_eq!(stream.buffer_capacity(), BufferCapacity::Bounded(3));
    Ok(())
}

#[test]
fn malformed_list_fails_before_any_worker_starts() {
    let list = source_list(&["cam1,usb:0", "broken"]);
    let err = VideoManager::from_list_file(list.path(), &ManagerOptions::default())
        .err()
        .expect("malformed list must fail");
    assert!(err.to_string().contains("line 2"));
}

#[test]
fn read_returns_one_entry_per_source_in_order() -> Result<()> {
    let entries = vec![
        SourceEntry::new("front", SourceDescriptor::parse("stub:front?width=16&height=8&fps=100")?),
        SourceEntry::new("back", SourceDescriptor::parse("stub:back?width=8&height=4&fps=100")?),
    ];
    let mut manager = VideoManager::new(entries, &ManagerOptions::default())?;

    let before = manager.read();
    assert_eq!(before.len(), 2);
    assert!(before.iter().all(Option::is_none));

    manager.start()?;
    manager.start()?;
    let front = manager.stream("front").expect("front");
    let back = manager.stream("back").expect("back");
    assert!(wait_for(Duration::from_secs(2), || front.more() && back.more()));

    let frames = manager.read();
    assert_eq!(frames.len(), 2);
    let front_frame = frames[0].as_ref().expect("front frame");
    let back_frame = frames[1].as_ref().expect("back frame");
    assert_eq!((front_frame.width, front_frame.height), (16, 8));
    assert_eq!((back_frame.width, back_frame.height), (8, 4));

    assert!(!manager.check_any_stopped());
    manager.stop();
    manager.stop();
    assert!(manager.check_all_stopped());
    assert!(manager.read().iter().all(Option::is_none));
    Ok(())
}

#[test]
fn info_opens_sources_and_reports_manual_fps() -> Result<()> {
    let list = source_list(&[
        "front,stub:front?width=32&height=16&fps=12",
        "back,stub:back,5",
    ]);
    let options = ManagerOptions {
        method: CaptureMethod::Snapshot,
        ..ManagerOptions::default()
    };
    let manager = VideoManager::from_list_file(list.path(), &options)?;
    assert!(manager.update_info().iter().all(|info| !info.inited));

    let infos = manager.get_all_videos_information();
    assert_eq!(infos.len(), 2);
    assert_eq!(infos[0].video_feed_name, "front");
    assert_eq!((infos[0].width, infos[0].height), (32, 16));
    assert_eq!(infos[0].fps, 12.0);
    assert!(!infos[0].manual_fps_inputted);
    assert!(infos[0].inited);

    assert_eq!(infos[1].fps, 5.0);
    assert!(infos[1].manual_fps_inputted);
    assert!(infos[1].inited);
    Ok(())
}

#[test]
fn max_height_resizes_frames_at_read_time() -> Result<()> {
    let entries = vec![SourceEntry::new(
        "tall",
        SourceDescriptor::parse("stub:tall?width=40&height=40&fps=100")?,
    )];
    let options = ManagerOptions {
        max_height: Some(20),
        ..ManagerOptions::default()
    };
    let mut manager = VideoManager::new(entries, &options)?;
    manager.start()?;
    let stream = manager.stream("tall").expect("stream");
    assert!(wait_for(Duration::from_secs(2), || stream.more()));

    let frames = manager.read();
    let frame = frames[0].as_ref().expect("frame");
    assert_eq!((frame.width, frame.height), (20, 20));
    manager.stop();
    Ok(())
}

/// Backend whose first capture panics, leaving it unusable.
struct PanickingBackend;

impl CaptureBackend for PanickingBackend {
    fn name(&self) -> &'static str {
        "panicking"
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Continuous
    }

    fn open(&mut self) -> Result<SourceInfo> {
        Ok(SourceInfo {
            fps: 10.0,
            width: 2,
            height: 2,
        })
    }

    fn capture_one(&mut self) -> Result<Frame> {
        panic!("decoder crashed");
    }

    fn close(&mut self) {}

    fn reconnect(&mut self) -> Result<()> {
        Ok(())
    }
}

#[test]
fn failed_start_stops_workers_already_started() -> Result<()> {
    let good = VideoStream::new(
        "good",
        SourceDescriptor::parse("stub:good?width=8&height=8&fps=100")?,
        StreamConfig::default(),
        CaptureMethod::Continuous,
    );
    let broken = VideoStream::with_backend(
        "broken",
        SourceDescriptor::parse("rtsp://h/broken")?,
        StreamConfig::default(),
        Box::new(PanickingBackend),
    );
    broken.start()?;
    thread::sleep(Duration::from_millis(50));
    broken.stop();

    let mut manager = VideoManager::from_streams(vec![good, broken])?;
    let err = manager.start().err().expect("broken worker must fail to start");
    assert!(format!("{:#}", err).contains("broken"));
    assert!(manager.is_stopped());
    assert!(manager.check_all_stopped());
    assert!(manager.stream("good").expect("good").is_stopped());
    Ok(())
}
