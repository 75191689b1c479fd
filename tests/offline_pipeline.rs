use comic_offline::core::config::JobsConfig;
use comic_offline::core::{
    DownloadJobInput, DownloadLibrary, Downloader, JobQueue, JobState, RetryPolicy, StaticProbe,
    StorageService, TracingNotifier, DOWNLOAD_TAG,
};
use comic_offline::db::{ChapterRepository, ComicRepository, Repository};
use comic_offline::remote::{ChapterDetail, ChapterSummary, ComicDetail, InMemoryRemote};
use comic_offline::DatabaseManager;

use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

struct Harness {
    remote: Arc<InMemoryRemote>,
    db: Arc<DatabaseManager>,
    storage: StorageService,
    downloader: Arc<Downloader>,
    dir: tempfile::TempDir,
}

fn summary(link: &str) -> ChapterSummary {
    ChapterSummary {
        chapter_link: link.to_string(),
        chapter_name: format!("Chapter {}", link),
        time: "2024-05-01".to_string(),
        view: "100".to_string(),
    }
}

/// Comic M1 lists five chapters newest first; C1 sits at index 2 with three images
fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let db = Arc::new(DatabaseManager::new(&dir.path().join("offline.db"), 4, Duration::from_secs(5)).unwrap());
    let remote = Arc::new(InMemoryRemote::new());

    let links = ["C3", "C2", "C1", "C0", "C-1"];
    for link in links {
        let images: Vec<String> = (0..3).map(|i| format!("https://cdn/{}/{}.png", link, i)).collect();
        for url in &images {
            remote.insert_blob(url.clone(), format!("bytes of {}", url).into_bytes());
        }
        remote.insert_chapter(ChapterDetail {
            chapter_link: link.to_string(),
            chapter_name: format!("Chapter {}", link),
            comic_link: "M1".to_string(),
            comic_name: "Moon & Stars: Vol.1".to_string(),
            images,
        });
    }
    remote.insert_blob("https://cdn/M1/thumb.png", b"thumb".to_vec());
    remote.insert_comic(ComicDetail {
        link: "M1".to_string(),
        title: "Moon & Stars: Vol.1".to_string(),
        thumbnail: "https://cdn/M1/thumb.png".to_string(),
        view: "9k".to_string(),
        last_updated: "today".to_string(),
        shortened_content: "A long trip".to_string(),
        authors: vec![],
        categories: vec![],
        chapters: links.iter().map(|l| summary(l)).collect(),
    });

    let storage = StorageService::new(dir.path());
    let retry = RetryPolicy {
        times: 3,
        initial_delay: Duration::from_millis(1),
        factor: 2.0,
        max_delay: Duration::from_millis(4),
    };
    let downloader = Arc::new(Downloader::new(remote.clone(), db.clone(), storage.clone(), retry));

    Harness { remote, db, storage, downloader, dir }
}

fn queue(h: &Harness) -> Arc<JobQueue> {
    let config = JobsConfig {
        max_concurrent_jobs: 2,
        constraint_poll_interval_ms: 10,
        requires_network: true,
        requires_storage_not_low: true,
        finished_job_retention_days: 7,
    };
    Arc::new(JobQueue::new(
        h.downloader.clone(),
        h.db.clone(),
        Arc::new(StaticProbe::available()),
        Arc::new(TracingNotifier),
        &config,
    ))
}

fn job_input(link: &str) -> DownloadJobInput {
    DownloadJobInput {
        chapter: summary(link),
        comic_link: "M1".to_string(),
        comic_name: "Moon & Stars: Vol.1".to_string(),
    }
}

async fn wait_for(queue: &JobQueue, id: &str, state: JobState) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while queue.job(id).await.unwrap().map(|j| j.state) != Some(state) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("job never reached the expected state");
}

#[tokio::test]
async fn downloads_chapter_with_progress_order_and_files() {
    let h = harness();

    let progress: Vec<u8> = h
        .downloader
        .download_chapter("C1", CancellationToken::new())
        .map(|item| item.unwrap().value())
        .collect()
        .await;
    assert_eq!(progress, vec![0, 10, 33, 56, 80, 90, 100]);

    let chapter = ChapterRepository::new(h.db.clone()).find_by_id("C1").await.unwrap().unwrap();
    assert_eq!(chapter.order, 3);
    assert_eq!(chapter.comic_link, "M1");
    assert_eq!(chapter.view, "100");
    assert_eq!(
        chapter.images,
        vec![
            "images/Moon___Stars__Vol.1/Chapter_C1/images_0.png",
            "images/Moon___Stars__Vol.1/Chapter_C1/images_1.png",
            "images/Moon___Stars__Vol.1/Chapter_C1/images_2.png",
        ]
    );
    for image in &chapter.images {
        assert!(h.dir.path().join(image).exists(), "missing {}", image);
    }

    let comic = ComicRepository::new(h.db.clone()).find_by_id("M1").await.unwrap().unwrap();
    assert_eq!(comic.thumbnail, "images/Moon___Stars__Vol.1/thumbnail.png");
    assert_eq!(comic.synopsis, "A long trip");
    assert!(h.dir.path().join(&comic.thumbnail).exists());
}

#[tokio::test]
async fn deleting_last_chapter_removes_comic_and_files() {
    let h = harness();
    let queue = queue(&h);
    let library = DownloadLibrary::new(h.db.clone(), h.storage.clone(), queue.clone());
    tokio::spawn(Arc::clone(&queue).start());

    let first = queue.enqueue_download(job_input("C1")).await.unwrap();
    let second = queue.enqueue_download(job_input("C2")).await.unwrap();
    wait_for(&queue, &first.id, JobState::Succeeded).await;
    wait_for(&queue, &second.id, JobState::Succeeded).await;

    let comic = library.comic("M1").await.unwrap().unwrap();
    let orders: Vec<i64> = comic.chapters.iter().map(|c| c.order).collect();
    assert_eq!(orders, vec![4, 3]);

    let reading = library.chapter("C1").await.unwrap().unwrap();
    assert_eq!(reading.next_chapter_link.as_deref(), Some("C2"));
    assert_eq!(reading.prev_chapter_link, None);

    library.delete_chapter("C1").await.unwrap();
    assert!(library.comic("M1").await.unwrap().is_some());

    library.delete_chapter("C2").await.unwrap();
    assert!(library.comic("M1").await.unwrap().is_none());
    assert!(library.comics().await.unwrap().is_empty());
    assert!(h.storage.list_files("images").await.unwrap().is_empty());

    queue.shutdown();
}

#[tokio::test]
async fn re_requesting_a_chapter_keeps_one_active_job() {
    let h = harness();
    h.remote.stall("https://cdn/C1/2.png");
    let queue = queue(&h);
    tokio::spawn(Arc::clone(&queue).start());

    let first = queue.enqueue_download(job_input("C1")).await.unwrap();
    wait_for(&queue, &first.id, JobState::Running).await;
    let second = queue.enqueue_download(job_input("C1")).await.unwrap();

    let active: Vec<_> = queue
        .query_by_tag("C1")
        .await
        .unwrap()
        .into_iter()
        .filter(|j| !j.state.is_finished())
        .collect();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, second.id);

    h.remote.release("https://cdn/C1/2.png");
    wait_for(&queue, &second.id, JobState::Succeeded).await;

    let all = queue.query_by_tag(DOWNLOAD_TAG).await.unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(ChapterRepository::new(h.db.clone()).find_all().await.unwrap().len(), 1);

    queue.shutdown();
}

#[tokio::test]
async fn dot_names_from_the_server_stay_inside_the_image_dir() {
    let h = harness();
    h.remote.insert_blob("https://cdn/dots/0.png", b"dots".to_vec());
    h.remote.insert_blob("https://cdn/dots/thumb.png", b"thumb".to_vec());
    h.remote.insert_chapter(ChapterDetail {
        chapter_link: "D1".to_string(),
        chapter_name: "..".to_string(),
        comic_link: "M2".to_string(),
        comic_name: "..".to_string(),
        images: vec!["https://cdn/dots/0.png".to_string()],
    });
    h.remote.insert_comic(ComicDetail {
        link: "M2".to_string(),
        title: "..".to_string(),
        thumbnail: "https://cdn/dots/thumb.png".to_string(),
        view: String::new(),
        last_updated: String::new(),
        shortened_content: String::new(),
        authors: vec![],
        categories: vec![],
        chapters: vec![summary("D1")],
    });

    let progress: Vec<u8> = h
        .downloader
        .download_chapter("D1", CancellationToken::new())
        .map(|item| item.unwrap().value())
        .collect()
        .await;
    assert_eq!(progress.last(), Some(&100));

    let chapter = ChapterRepository::new(h.db.clone()).find_by_id("D1").await.unwrap().unwrap();
    assert_eq!(chapter.images, vec!["images/_/_/images_0.png"]);
    assert_eq!(std::fs::read(h.dir.path().join("images/_/_/images_0.png")).unwrap(), b"dots");
    assert!(h.dir.path().join("images/_/thumbnail.png").exists());
    assert!(!h.dir.path().join("thumbnail.png").exists());
    assert!(!h.dir.path().parent().unwrap().join("images_0.png").exists());
}
