use std::path::PathBuf;

use tokio::sync::watch;
use warp::filters::BoxedFilter;
use warp::{Filter, Rejection, Reply};

use crate::scheduler::PlayoutStatus;
use crate::server::types::{SinkFile, StatusPage};
use crate::sink::OutputSink;

mod types;

/// Read-only HTTP surface: a status page, the status as JSON, and the files of the
/// output sink under `/<output_path>/`.
pub fn make_server(
    status: watch::Receiver<PlayoutStatus>,
    sink: &OutputSink,
    output_path: String,
) -> BoxedFilter<(impl Reply,)> {
    let manifest_url = format!("/{}/{}", output_path, sink.manifest_name());

    let page_status = status.clone();
    let index = warp::path::end().map(move || StatusPage {
        status: page_status.borrow().clone(),
        manifest_url: manifest_url.clone(),
    });

    let status_json =
        warp::path!("status").map(move || warp::reply::json(&*status.borrow()));

    let directory = sink.directory().to_path_buf();
    let files = warp::path(output_path)
        .and(warp::path::param::<String>())
        .and(warp::path::end())
        .and_then(move |name: String| read_sink_file(directory.clone(), name));

    warp::get().and(index.or(status_json).or(files)).boxed()
}

async fn read_sink_file(directory: PathBuf, name: String) -> Result<SinkFile, Rejection> {
    // Only plain file names inside the sink; never walk out of it.
    if name.starts_with('.') || name.contains(['/', '\\', '%']) {
        return Err(warp::reject::not_found());
    }

    let data = tokio::fs::read(directory.join(&name))
        .await
        .map_err(|_| warp::reject::not_found())?;

    Ok(SinkFile {
        content_type: SinkFile::content_type_for(&name),
        data,
    })
}
