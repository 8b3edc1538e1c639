use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use timetable_sync::category::Category;
use timetable_sync::render::{RenderEngine, RenderError, RenderOptions, invert_colors};
use timetable_sync::sync::{
    BackgroundPolicy, DocumentCache, RemoteDocumentRef, SyncParts, SyncStateMachine,
    TransferCoordinator,
};
use timetable_sync::test_utils::fakes::{
    FakeConfig, FakeNetwork, ScriptedEngine, SyntheticDecoder, synthetic_pixel,
    write_synthetic_document,
};

const PRIMARY_URL: &str = "https://school.example/plans/high.pdf";
const SECONDARY_URL: &str = "https://school.example/plans/middle.pdf";

struct Fixture {
    _tmp: TempDir,
    cache: DocumentCache,
    decoder: Arc<SyntheticDecoder>,
    machine: SyncStateMachine,
}

/// A machine whose two categories both have a 500x800 document cached.
fn fixture() -> Fixture {
    let tmp = TempDir::new().unwrap();
    let cache = DocumentCache::new(tmp.path()).unwrap();
    for (category, url) in [(Category::Primary, PRIMARY_URL), (Category::Secondary, SECONDARY_URL)] {
        let doc = RemoteDocumentRef::new(category, url);
        write_synthetic_document(&cache.path_for(&doc).unwrap(), 500, 800).unwrap();
    }

    let decoder = Arc::new(SyntheticDecoder::new());
    let renderer = Arc::new(RenderEngine::new(
        cache.clone(),
        decoder.clone(),
        RenderOptions::default(),
    ));
    let machine = SyncStateMachine::new(
        SyncParts {
            config: Arc::new(
                FakeConfig::new()
                    .with_url(Category::Primary, PRIMARY_URL)
                    .with_url(Category::Secondary, SECONDARY_URL),
            ),
            cache: cache.clone(),
            transfers: TransferCoordinator::new(
                Arc::new(ScriptedEngine::new()),
                BackgroundPolicy::Complete,
            ),
            reachability: Arc::new(FakeNetwork::up()),
            renderer,
        },
        Category::Primary,
    );

    Fixture {
        _tmp: tmp,
        cache,
        decoder,
        machine,
    }
}

#[test]
fn dark_page_render_inverts_opaque_pixels_only() {
    let f = fixture();
    let bitmap = f
        .machine
        .renderer()
        .render_page(Category::Primary, 1000, 1.0, true)
        .unwrap();

    assert_eq!(bitmap.dimensions(), (1000, 1600));

    // Scale 2: pixel (100, 50) samples the page at (50.25, 25.25).
    assert_eq!(synthetic_pixel(50.25, 25.25), [50, 25, 200, 255]);
    assert_eq!(bitmap.pixel(100, 50), Some([205, 230, 55, 255]));

    // The left 20 document units (40 pixels) are transparent and left alone.
    assert_eq!(bitmap.pixel(10, 10), Some(synthetic_pixel(5.25, 5.25)));
    assert_eq!(bitmap.pixel(10, 10).map(|p| p[3]), Some(0));
}

#[test]
fn dark_and_light_renders_are_inverses() {
    let f = fixture();
    let renderer = f.machine.renderer();
    let light = renderer.render_page(Category::Primary, 250, 1.0, false).unwrap();
    let dark = renderer.render_page(Category::Primary, 250, 1.0, true).unwrap();

    assert_eq!(light.dimensions(), dark.dimensions());
    for (l, d) in light.pixels().chunks_exact(4).zip(dark.pixels().chunks_exact(4)) {
        if l[3] == 0 {
            assert_eq!(l, d);
        } else {
            assert_eq!([255 - l[0], 255 - l[1], 255 - l[2], l[3]], [d[0], d[1], d[2], d[3]]);
        }
    }

    let mut back = (*dark).clone();
    invert_colors(&mut back);
    assert_eq!(back, *light);
}

#[test]
fn switching_during_a_render_hands_the_decoder_over() {
    let f = fixture();
    let renderer = Arc::clone(f.machine.renderer());
    let hold = f.decoder.hold_next_render();

    let first = {
        let renderer = Arc::clone(&renderer);
        std::thread::spawn(move || renderer.render_page(Category::Primary, 500, 1.0, false))
    };
    hold.entered.recv_timeout(Duration::from_secs(5)).unwrap();

    // Must not wait for the render holding the decoder.
    f.machine.switch_category(Category::Secondary);
    assert_eq!(f.machine.selected(), Category::Secondary);

    let (done_tx, done_rx) = flume::bounded(1);
    let second = {
        let renderer = Arc::clone(&renderer);
        std::thread::spawn(move || {
            let result = renderer.render_page(Category::Secondary, 500, 1.0, false);
            let _ = done_tx.send(());
            result
        })
    };
    assert!(done_rx.recv_timeout(Duration::from_millis(100)).is_err());

    hold.release.send(()).unwrap();
    assert_eq!(first.join().unwrap().unwrap().dimensions(), (500, 800));
    assert_eq!(second.join().unwrap().unwrap().dimensions(), (500, 800));

    let stats = f.decoder.stats();
    let secondary_path = f.cache.latest(Category::Secondary).unwrap().path;
    assert!(stats.opened().contains(&secondary_path));
    assert_eq!(stats.live(), 1);
    assert_eq!(
        renderer.bound_file(Category::Secondary).map(|file| file.path),
        Some(secondary_path)
    );
    assert!(renderer.bound_file(Category::Primary).is_none());
    f.machine.join_background();
}

#[test]
fn renders_and_switches_interleave_without_deadlock() {
    let f = fixture();
    let renderer = f.machine.renderer();

    std::thread::scope(|scope| {
        for worker in 0..4u32 {
            scope.spawn(move || {
                for i in 0..20u32 {
                    let category = Category::ALL[((worker + i) % 2) as usize];
                    let width = 100 + (i % 3) * 50;
                    let bitmap = renderer.render_page(category, width, 1.0, i % 2 == 0).unwrap();
                    assert_eq!(bitmap.width(), width);
                }
            });
        }
        for i in 0..20 {
            f.machine.switch_category(Category::ALL[i % 2]);
            std::thread::sleep(Duration::from_millis(1));
        }
    });
    f.machine.join_background();

    assert!(f.decoder.stats().live() <= 1);
}

#[test]
fn render_without_cached_document_reports_it() {
    let f = fixture();
    f.cache.clear(Category::Secondary).unwrap();

    assert!(matches!(
        f.machine.renderer().render_page(Category::Secondary, 500, 1.0, false),
        Err(RenderError::NoCachedFile(Category::Secondary))
    ));
    assert_eq!(f.decoder.stats().live(), 0);
}

#[test]
fn region_tiles_match_the_page_they_come_from() {
    let f = fixture();
    let renderer = f.machine.renderer();
    let page = renderer.render_page(Category::Primary, 1000, 1.0, false).unwrap();

    let tile = renderer
        .render_region(
            Category::Primary,
            timetable_sync::render::Region::new(600, 1500, 500, 500),
            2.0,
            1,
            false,
        )
        .unwrap();

    assert_eq!(tile.dimensions(), (400, 100));
    for (x, y) in [(0, 0), (399, 99), (123, 45)] {
        assert_eq!(tile.pixel(x, y), page.pixel(600 + x, 1500 + y));
    }
}
