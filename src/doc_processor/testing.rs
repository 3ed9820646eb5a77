//! Small PDFs built in memory for the extraction tests.

use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object, ObjectId, Stream};

pub fn text_at(x: i64, y: i64, text: &str) -> Vec<Operation> {
    vec![
        Operation::new("BT", vec![]),
        Operation::new("Tf", vec!["F1".into(), 10.into()]),
        Operation::new(
            "Tm",
            vec![
                1.into(),
                0.into(),
                0.into(),
                1.into(),
                Object::Integer(x),
                Object::Integer(y),
            ],
        ),
        Operation::new("Tj", vec![Object::string_literal(text)]),
        Operation::new("ET", vec![]),
    ]
}

pub fn line(x0: i64, y0: i64, x1: i64, y1: i64) -> Vec<Operation> {
    vec![
        Operation::new("m", vec![Object::Integer(x0), Object::Integer(y0)]),
        Operation::new("l", vec![Object::Integer(x1), Object::Integer(y1)]),
        Operation::new("S", vec![]),
    ]
}

/// A ruled table with its top-left corner at (x, top); rows are 20pt tall
/// and columns 150pt wide.
pub fn ruled_table(x: i64, top: i64, rows: &[&[&str]]) -> Vec<Operation> {
    let ncols = rows.iter().map(|r| r.len()).max().unwrap_or(0) as i64;
    let bottom = top - 20 * rows.len() as i64;
    let right = x + 150 * ncols;
    let mut ops = Vec::new();
    for r in 0..=rows.len() as i64 {
        ops.extend(line(x, top - 20 * r, right, top - 20 * r));
    }
    for c in 0..=ncols {
        ops.extend(line(x + 150 * c, bottom, x + 150 * c, top));
    }
    for (r, row) in rows.iter().enumerate() {
        for (c, cell) in row.iter().enumerate() {
            ops.extend(text_at(
                x + 150 * c as i64 + 5,
                top - 20 * r as i64 - 15,
                cell,
            ));
        }
    }
    ops
}

/// Paint XObject `name` as a 100pt square.
pub fn draw_image(name: &str) -> Vec<Operation> {
    vec![
        Operation::new("q", vec![]),
        Operation::new(
            "cm",
            vec![100.into(), 0.into(), 0.into(), 100.into(), 50.into(), 50.into()],
        ),
        Operation::new("Do", vec![Object::Name(name.as_bytes().to_vec())]),
        Operation::new("Q", vec![]),
    ]
}

fn font(doc: &mut Document) -> ObjectId {
    doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Courier",
    })
}

/// A one-font PDF with one page per operation list. Resources live on the
/// page tree root and are inherited by every page.
pub fn build_pdf(pages: Vec<Vec<Operation>>) -> Document {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = font(&mut doc);
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! {
            "F1" => font_id,
        },
    });
    let mut kids = Vec::new();
    for operations in pages {
        let content = Content { operations };
        let content_id = doc.add_object(Stream::new(
            dictionary! {},
            content.encode().expect("encode content"),
        ));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
        });
        kids.push(page_id.into());
    }
    let count = kids.len() as i64;
    let pages = dictionary! {
        "Type" => "Pages",
        "Kids" => kids,
        "Count" => count,
        "Resources" => resources_id,
        "MediaBox" => vec![0.into(), 0.into(), 595.into(), 842.into()],
    };
    doc.objects.insert(pages_id, Object::Dictionary(pages));
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);
    doc
}

/// A 2x2 solid red image, uncompressed 8-bit RGB.
pub fn red_square() -> Stream {
    Stream::new(
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => 2,
            "Height" => 2,
            "ColorSpace" => "DeviceRGB",
            "BitsPerComponent" => 8,
        },
        [255u8, 0, 0].repeat(4),
    )
}

/// Give page `page_num` its own resources holding the font and `image`
/// under XObject `name`.
pub fn attach_image(doc: &mut Document, page_num: u32, name: &str, image: Stream) -> ObjectId {
    let image_id = doc.add_object(image);
    let font_id = font(doc);
    let page_id = doc.get_pages()[&page_num];
    let page = doc
        .get_object_mut(page_id)
        .and_then(Object::as_dict_mut)
        .expect("page dictionary");
    page.set(
        "Resources",
        dictionary! {
            "Font" => dictionary! { "F1" => font_id },
            "XObject" => dictionary! { name => image_id },
        },
    );
    image_id
}

pub fn pdf_bytes(mut doc: Document) -> Vec<u8> {
    let mut bytes = Vec::new();
    doc.save_to(&mut bytes).expect("save pdf");
    bytes
}
