// Surface: the rendering/automation collaborator behind one trait.
//
// ChromeSurface drives a real browser page; testing::MockSurface serves a
// scripted review feed from memory. Everything above this seam (detector,
// expansion, scroll driver, collection loop) is surface-agnostic.

use anyhow::Result;
use async_trait::async_trait;
use browser_surface::ChromeSurface;
use harvest_common::ElementRef;
use serde_json::Value;

#[async_trait]
pub trait Surface: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<()>;

    async fn current_url(&self) -> Result<String>;

    async fn title(&self) -> Result<String>;

    /// All elements in the page matching `selector`, in document order.
    async fn query(&self, selector: &str) -> Result<Vec<ElementRef>>;

    /// Descendants of `scope` matching `selector`, in document order.
    async fn query_within(&self, scope: ElementRef, selector: &str) -> Result<Vec<ElementRef>>;

    async fn inner_text(&self, element: ElementRef) -> Result<String>;

    async fn attribute(&self, element: ElementRef, name: &str) -> Result<Option<String>>;

    /// Run a JS function expression with `element` as `this` and `args` as
    /// its only argument.
    async fn evaluate(&self, element: ElementRef, script: &str, args: Value) -> Result<Value>;

    async fn click(&self, element: ElementRef) -> Result<()>;

    /// Coarse pointer-wheel scroll over the element.
    async fn wheel(&self, element: ElementRef, delta_y: f64) -> Result<()>;

    async fn bring_to_front(&self) -> Result<()>;

    async fn block_heavy_resources(&self) -> Result<()>;

    /// Invalidate every handle issued so far.
    async fn release_handles(&self);

    async fn first_within(&self, scope: ElementRef, selector: &str) -> Result<Option<ElementRef>> {
        Ok(self.query_within(scope, selector).await?.into_iter().next())
    }
}

#[async_trait]
impl Surface for ChromeSurface {
    async fn navigate(&self, url: &str) -> Result<()> {
        Ok(ChromeSurface::navigate(self, url).await?)
    }

    async fn current_url(&self) -> Result<String> {
        Ok(ChromeSurface::current_url(self).await?)
    }

    async fn title(&self) -> Result<String> {
        Ok(ChromeSurface::title(self).await?)
    }

    async fn query(&self, selector: &str) -> Result<Vec<ElementRef>> {
        Ok(ChromeSurface::query(self, selector).await?)
    }

    async fn query_within(&self, scope: ElementRef, selector: &str) -> Result<Vec<ElementRef>> {
        Ok(ChromeSurface::query_within(self, scope, selector).await?)
    }

    async fn inner_text(&self, element: ElementRef) -> Result<String> {
        Ok(ChromeSurface::inner_text(self, element).await?)
    }

    async fn attribute(&self, element: ElementRef, name: &str) -> Result<Option<String>> {
        Ok(ChromeSurface::attribute(self, element, name).await?)
    }

    async fn evaluate(&self, element: ElementRef, script: &str, args: Value) -> Result<Value> {
        Ok(ChromeSurface::evaluate(self, element, script, args).await?)
    }

    async fn click(&self, element: ElementRef) -> Result<()> {
        Ok(ChromeSurface::click(self, element).await?)
    }

    async fn wheel(&self, element: ElementRef, delta_y: f64) -> Result<()> {
        Ok(ChromeSurface::wheel(self, element, delta_y).await?)
    }

    async fn bring_to_front(&self) -> Result<()> {
        Ok(ChromeSurface::bring_to_front(self).await?)
    }

    async fn block_heavy_resources(&self) -> Result<()> {
        Ok(ChromeSurface::block_heavy_resources(self).await?)
    }

    async fn release_handles(&self) {
        ChromeSurface::release_handles(self).await
    }
}
