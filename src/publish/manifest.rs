//! Manifest page generation.
//!
//! The manifest is a static index document listing every published content
//! id as an embedded image. It is itself published like any other file,
//! so the batch's public URL is just the manifest's gateway URL.

use crate::pup::ContentId;

/// Render the index page for a batch, in input order.
pub fn index_html(cids: &[ContentId]) -> String {
    let mut page = String::from(
        "<html>\n\
         \x20   <head>\n\
         \x20       <title>Images</title>\n\
         \x20   </head>\n\
         \x20   <body>\n\
         \x20       <h1>Images</h1>\n",
    );
    for cid in cids {
        page.push_str(&format!(
            "        <img src=\"/ipfs/{cid}\" style=\"max-width:100%; max-height:100vh; margin:auto\" />\n"
        ));
    }
    page.push_str("    </body>\n</html>\n");
    page
}

/// Public gateway URL for a content id.
pub fn gateway_url(cid: &ContentId) -> String {
    format!("http://ipfs.io/ipfs/{cid}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lists_cids_in_input_order() {
        let cids = vec![
            ContentId::from("QmFirst"),
            ContentId::from("QmSecond"),
            ContentId::from("QmThird"),
        ];
        let html = index_html(&cids);

        let first = html.find("QmFirst").unwrap();
        let second = html.find("QmSecond").unwrap();
        let third = html.find("QmThird").unwrap();
        assert!(first < second && second < third);
        assert!(html.contains("<img src=\"/ipfs/QmFirst\""));
    }

    #[test]
    fn empty_batch_renders_a_page_with_no_images() {
        let html = index_html(&[]);
        assert!(!html.contains("<img"));
        assert!(html.contains("<h1>Images</h1>"));
    }

    #[test]
    fn gateway_url_embeds_the_cid() {
        assert_eq!(
            gateway_url(&ContentId::from("QmX")),
            "http://ipfs.io/ipfs/QmX"
        );
    }
}
