//! Embedded images: finding them, stripping them out of the page content
//! and getting a caption for each from a vision-capable model.

use super::ExtractError;
use crate::llm::{ChatMessage, ChatRequest, CompletionService, ImageAttachment};
use base64::Engine;
use image::{DynamicImage, GrayImage, ImageFormat, RgbImage};
use lopdf::content::Content;
use lopdf::{Dictionary, Document, Object, ObjectId, Stream};
use std::collections::{BTreeMap, HashSet};
use std::io::Cursor;
use tracing::{debug, warn};

pub const CAPTION_PROMPT: &str = "Describe this image from the PDF:";

const MAX_FORM_DEPTH: usize = 8;

/// The content stream holding the `Do` that paints an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PaintedBy {
    Page(ObjectId),
    /// A Form XObject, nested at any depth below the page.
    Form(ObjectId),
}

/// An image XObject painted somewhere on a page.
#[derive(Debug, Clone)]
pub struct PdfImage {
    /// 1-based page number.
    pub page: u32,
    /// Resource name the painting content stream uses for it.
    pub name: Vec<u8>,
    pub painted_by: PaintedBy,
    pub stream: Stream,
}

fn resolve<'a>(doc: &'a Document, object: &'a Object) -> Option<&'a Object> {
    match object {
        Object::Reference(id) => doc.get_object(*id).ok(),
        other => Some(other),
    }
}

fn resolve_dict<'a>(doc: &'a Document, object: &'a Object) -> Option<&'a Dictionary> {
    resolve(doc, object)?.as_dict().ok()
}

/// Resources of a page, following the page tree upwards when the page
/// inherits them.
fn page_resources(doc: &Document, page_id: ObjectId) -> Option<&Dictionary> {
    let mut node = doc.get_dictionary(page_id).ok()?;
    for _ in 0..32 {
        if let Ok(resources) = node.get(b"Resources") {
            return resolve_dict(doc, resources);
        }
        let parent = node.get(b"Parent").ok()?.as_reference().ok()?;
        node = doc.get_dictionary(parent).ok()?;
    }
    None
}

fn has_subtype(stream: &Stream, subtype: &[u8]) -> bool {
    matches!(stream.dict.get(b"Subtype"), Ok(Object::Name(name)) if name.as_slice() == subtype)
}

struct ImageWalk<'a> {
    doc: &'a Document,
    page: u32,
    /// Forms already entered on this page.
    seen: HashSet<ObjectId>,
    images: Vec<PdfImage>,
}

impl ImageWalk<'_> {
    fn visit(&mut self, resources: &Dictionary, painted_by: PaintedBy, depth: usize) {
        let doc = self.doc;
        let Some(xobjects) = resources
            .get(b"XObject")
            .ok()
            .and_then(|x| resolve_dict(doc, x))
        else {
            return;
        };
        for (name, object) in xobjects.iter() {
            let Some(Object::Stream(stream)) = resolve(doc, object) else {
                continue;
            };
            if has_subtype(stream, b"Image") {
                self.images.push(PdfImage {
                    page: self.page,
                    name: name.clone(),
                    painted_by,
                    stream: stream.clone(),
                });
                continue;
            }
            let Ok(form_id) = object.as_reference() else {
                continue;
            };
            if !has_subtype(stream, b"Form") || !self.seen.insert(form_id) {
                continue;
            }
            if depth >= MAX_FORM_DEPTH {
                debug!("page {}: forms nested too deep, not descending", self.page);
                continue;
            }
            // Forms without their own resources use the enclosing ones.
            let form_resources = stream
                .dict
                .get(b"Resources")
                .ok()
                .and_then(|r| resolve_dict(doc, r))
                .unwrap_or(resources);
            self.visit(form_resources, PaintedBy::Form(form_id), depth + 1);
        }
    }
}

/// Every image XObject, in page order, including images painted from
/// inside Form XObjects.
pub fn collect_images(doc: &Document) -> Vec<PdfImage> {
    let mut images = Vec::new();
    for (page_num, page_id) in doc.get_pages() {
        let Some(resources) = page_resources(doc, page_id) else {
            continue;
        };
        let mut walk = ImageWalk {
            doc,
            page: page_num,
            seen: HashSet::new(),
            images: Vec::new(),
        };
        walk.visit(resources, PaintedBy::Page(page_id), 0);
        images.append(&mut walk.images);
    }
    debug!("found {} embedded images", images.len());
    images
}

fn stream_bytes(stream: &Stream) -> Result<Vec<u8>, lopdf::Error> {
    if filters(&stream.dict).is_empty() {
        Ok(stream.content.clone())
    } else {
        stream.decompressed_content()
    }
}

fn strip_paints(content: &mut Content, names: &HashSet<&[u8]>) -> usize {
    let before = content.operations.len();
    content.operations.retain(|op| {
        let paints_image = op.operator == "Do"
            && matches!(op.operands.first(), Some(Object::Name(n)) if names.contains(n.as_slice()));
        !paints_image
    });
    before - content.operations.len()
}

fn strip_from(
    doc: &mut Document,
    painted_by: PaintedBy,
    names: &HashSet<&[u8]>,
) -> Result<usize, ExtractError> {
    match painted_by {
        PaintedBy::Page(page_id) => {
            let mut content = Content::decode(&doc.get_page_content(page_id)?)?;
            let dropped = strip_paints(&mut content, names);
            if dropped > 0 {
                doc.change_page_content(page_id, content.encode()?)?;
            }
            Ok(dropped)
        }
        PaintedBy::Form(form_id) => {
            let bytes = stream_bytes(doc.get_object(form_id)?.as_stream()?)?;
            let mut content = Content::decode(&bytes)?;
            let dropped = strip_paints(&mut content, names);
            if dropped > 0 {
                let encoded = content.encode()?;
                doc.get_object_mut(form_id)?
                    .as_stream_mut()?
                    .set_plain_content(encoded);
            }
            Ok(dropped)
        }
    }
}

/// Drop the `Do` operators that paint the given images so pages keep only
/// their text and vector content. A content stream that cannot be read or
/// rewritten keeps its images. Returns how many draws were removed.
pub fn remove_images(doc: &mut Document, images: &[PdfImage]) -> usize {
    let mut by_painter: BTreeMap<PaintedBy, (u32, HashSet<&[u8]>)> = BTreeMap::new();
    for image in images {
        by_painter
            .entry(image.painted_by)
            .or_insert_with(|| (image.page, HashSet::new()))
            .1
            .insert(image.name.as_slice());
    }

    let mut removed = 0;
    for (painted_by, (page, names)) in &by_painter {
        match strip_from(doc, *painted_by, names) {
            Ok(dropped) => removed += dropped,
            Err(e) => warn!("page {} keeps its images: {}", page, e),
        }
    }
    removed
}

fn filters(dict: &Dictionary) -> Vec<Vec<u8>> {
    match dict.get(b"Filter") {
        Ok(Object::Name(name)) => vec![name.clone()],
        Ok(Object::Array(items)) => items
            .iter()
            .filter_map(|item| item.as_name().ok().map(|n| n.to_vec()))
            .collect(),
        _ => Vec::new(),
    }
}

fn components(dict: &Dictionary, samples: usize, pixels: usize) -> usize {
    match dict.get(b"ColorSpace") {
        Ok(Object::Name(name)) => match name.as_slice() {
            b"DeviceGray" | b"CalGray" => 1,
            b"DeviceCMYK" => 4,
            _ => 3,
        },
        _ if pixels > 0 => samples / pixels,
        _ => 0,
    }
}

fn cmyk_to_rgb(data: &[u8]) -> Vec<u8> {
    data.chunks_exact(4)
        .flat_map(|px| {
            let k = 255 - px[3] as u16;
            [px[0], px[1], px[2]].map(|c| ((255 - c as u16) * k / 255) as u8)
        })
        .collect()
}

fn decode(stream: &Stream) -> Result<DynamicImage, ExtractError> {
    let filters = filters(&stream.dict);
    let unsupported = filters.iter().find(|f| {
        matches!(f.as_slice(), b"JPXDecode" | b"JBIG2Decode" | b"CCITTFaxDecode")
    });
    if let Some(f) = unsupported {
        return Err(ExtractError::UnsupportedImage(format!(
            "{} images are not supported",
            String::from_utf8_lossy(f)
        )));
    }
    if filters.iter().any(|f| f.as_slice() == b"DCTDecode") {
        return Ok(image::load_from_memory_with_format(&stream.content, ImageFormat::Jpeg)?);
    }

    let raw = stream_bytes(stream)?;
    let width = stream.dict.get(b"Width")?.as_i64()? as u32;
    let height = stream.dict.get(b"Height")?.as_i64()? as u32;
    let bits = stream
        .dict
        .get(b"BitsPerComponent")
        .and_then(Object::as_i64)
        .unwrap_or(8);
    if bits != 8 {
        return Err(ExtractError::UnsupportedImage(format!("{} bits per component", bits)));
    }

    let pixels = width as usize * height as usize;
    let invalid =
        || ExtractError::UnsupportedImage(format!("malformed {}x{} image", width, height));
    match components(&stream.dict, raw.len(), pixels) {
        1 => {
            let luma = raw.get(..pixels).ok_or_else(invalid)?.to_vec();
            GrayImage::from_raw(width, height, luma)
                .map(DynamicImage::ImageLuma8)
                .ok_or_else(invalid)
        }
        3 => {
            let rgb = raw.get(..pixels * 3).ok_or_else(invalid)?.to_vec();
            RgbImage::from_raw(width, height, rgb)
                .map(DynamicImage::ImageRgb8)
                .ok_or_else(invalid)
        }
        4 => {
            let rgb = cmyk_to_rgb(raw.get(..pixels * 4).ok_or_else(invalid)?);
            RgbImage::from_raw(width, height, rgb)
                .map(DynamicImage::ImageRgb8)
                .ok_or_else(invalid)
        }
        n => Err(ExtractError::UnsupportedImage(format!("{} colour components", n))),
    }
}

impl PdfImage {
    /// Re-encode as PNG and base64 it for a data URL.
    pub fn to_png_base64(&self) -> Result<String, ExtractError> {
        let image = decode(&self.stream)?;
        let mut png = Cursor::new(Vec::new());
        image.write_to(&mut png, ImageFormat::Png)?;
        Ok(base64::engine::general_purpose::STANDARD.encode(png.into_inner()))
    }
}

async fn caption<C: CompletionService>(
    captioner: &C,
    image: &PdfImage,
    model: &str,
    max_tokens: u32,
) -> Result<String, String> {
    let data = image.to_png_base64().map_err(|e| e.to_string())?;
    let mut request = ChatRequest::new(vec![ChatMessage::user(CAPTION_PROMPT)], model);
    request.max_tokens = Some(max_tokens);
    request.image = Some(ImageAttachment::png(data));
    let response = captioner
        .complete(&request)
        .await
        .map_err(|e| e.to_string())?;
    Ok(response.content.trim().to_string())
}

/// Caption every image. Failures become an error line for that image
/// rather than aborting the batch. Lines are grouped by page.
pub async fn describe_images<C: CompletionService>(
    images: &[PdfImage],
    captioner: &C,
    model: &str,
    max_tokens: u32,
) -> BTreeMap<u32, Vec<String>> {
    let mut descriptions: BTreeMap<u32, Vec<String>> = BTreeMap::new();
    for image in images {
        let line = match caption(captioner, image, model, max_tokens).await {
            Ok(text) => format!("Page {} Image: {}", image.page, text),
            Err(e) => {
                warn!("failed to describe image on page {}: {}", image.page, e);
                format!("Page {} Image: Error describing image ({})", image.page, e)
            }
        };
        descriptions.entry(image.page).or_default().push(line);
    }
    descriptions
}
