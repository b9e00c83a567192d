use docker_compose_types::{Compose, Service, Services};
use indexmap::IndexMap;

use crate::error::Result;

/// Render a compose override that pins each service to an image.
///
/// Layered with `-f` over the project's own compose file and started
/// with `--no-build`, it brings back the images a snapshot tagged
/// without rebuilding anything.
pub fn render_override(images: &IndexMap<String, String>) -> Result<String> {
    let services = images
        .iter()
        .map(|(name, image)| {
            let service = Service {
                image: Some(image.clone()),
                ..Default::default()
            };
            (name.clone(), Some(service))
        })
        .collect();

    let compose = Compose {
        services: Services(services),
        ..Default::default()
    };

    Ok(serde_yaml::to_string(&compose)?)
}
